use std::path::PathBuf;

use chrono::NaiveDate;
use retail_etl_common::{
    pipeline::{PipelineDefinition, PipelineInfo, Schedule},
    resource_manager::{
        ExecutionContext, LocalProcessExecutionContext, StoredProcedureExecutionContext,
    },
    task::TaskDefinition,
};

pub const RETAIL_PIPELINE_NAME: &str = "retail_etl_pipeline";

pub const ENV_PYTHON: &str = "RETAIL_ETL_PYTHON";
pub const ENV_SCRIPTS_DIR: &str = "RETAIL_ETL_SCRIPTS_DIR";
pub const ENV_SCHEMA_SQL: &str = "RETAIL_ETL_SCHEMA_SQL";

/// Locations of the external scripts the built-in pipeline invokes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetailPipelineSettings {
    pub python: String,
    pub scripts_dir: PathBuf,
    pub schema_sql: PathBuf,
}

impl Default for RetailPipelineSettings {
    fn default() -> Self {
        Self {
            python: "python".to_string(),
            scripts_dir: PathBuf::from("/opt/retail-etl/scripts"),
            schema_sql: PathBuf::from("/opt/retail-etl/sql/03_ddl_tables.sql"),
        }
    }
}

impl RetailPipelineSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Self {
            python: get(ENV_PYTHON).unwrap_or(defaults.python),
            scripts_dir: get(ENV_SCRIPTS_DIR)
                .map(PathBuf::from)
                .unwrap_or(defaults.scripts_dir),
            schema_sql: get(ENV_SCHEMA_SQL)
                .map(PathBuf::from)
                .unwrap_or(defaults.schema_sql),
        }
    }

    fn script(&self, name: &str) -> String {
        self.scripts_dir.join(name).to_string_lossy().into_owned()
    }
}

fn task(
    info: &PipelineInfo,
    name: &str,
    description: &str,
    context: ExecutionContext,
    upstream: Option<&str>,
) -> TaskDefinition {
    TaskDefinition {
        id: TaskDefinition::stable_id(info.id, name),
        pipeline_id: info.id,
        name: name.to_string(),
        description: Some(description.to_string()),
        execution_context: context,
        depends_on: upstream
            .map(|up| vec![TaskDefinition::stable_id(info.id, up)])
            .unwrap_or_default(),
    }
}

/// The daily retail pipeline: reset schema, generate sales data, load.
pub fn retail_etl_pipeline(settings: &RetailPipelineSettings, procedure: &str) -> PipelineDefinition {
    let start_date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default();
    let mut info = PipelineInfo::new(
        RETAIL_PIPELINE_NAME,
        Some("Retail ETL: reset schema, generate sales data, load the warehouse".to_string()),
        Schedule::daily(start_date),
    );
    info.tags = vec!["retail".to_string(), "warehouse".to_string()];

    let reset_schema = task(
        &info,
        "reset_schema",
        "Drop and recreate the staging tables",
        ExecutionContext::LocalProcess(LocalProcessExecutionContext {
            entry_point: vec![settings.python.clone()],
            args: vec![
                settings.script("data_truncate.py"),
                settings.schema_sql.to_string_lossy().into_owned(),
            ],
            ..Default::default()
        }),
        None,
    );

    let generate_sales_data = task(
        &info,
        "generate_sales_data",
        "Generate synthetic sales records",
        ExecutionContext::LocalProcess(LocalProcessExecutionContext {
            entry_point: vec![settings.python.clone()],
            args: vec![settings.script("generate_data.py")],
            ..Default::default()
        }),
        Some("reset_schema"),
    );

    let trigger_stored_procedure = task(
        &info,
        "trigger_stored_procedure",
        "Load the generated data into the warehouse",
        ExecutionContext::StoredProcedure(StoredProcedureExecutionContext {
            procedure: procedure.to_string(),
        }),
        Some("generate_sales_data"),
    );

    PipelineDefinition {
        task_definitions: vec![reset_schema, generate_sales_data, trigger_stored_procedure],
        info,
    }
}
