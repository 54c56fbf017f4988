use std::{collections::HashSet, path::Path, time::Duration};

use retail_etl_common::{
    error::Error,
    pipeline::{PipelineDefinition, PipelineInfo, Schedule, ScheduleInterval},
    resource_manager::{
        ExecutionContext, LocalProcessExecutionContext, StoredProcedureExecutionContext,
    },
    task::TaskDefinition,
};

use crate::schema::{PipelineFile, Step};

const SUPPORTED_VERSION: &str = "1";

pub fn parse_yaml(yaml_str: &str) -> Result<PipelineFile, Error> {
    let file: PipelineFile = serde_yaml::from_str(yaml_str).map_err(|e| {
        let err = if let Some(location) = e.location() {
            ParseError::InvalidYaml {
                line: location.line(),
                column: location.column(),
                message: e.to_string(),
            }
        } else {
            ParseError::InvalidYamlNoLocation {
                message: e.to_string(),
            }
        };
        Error::InvalidInput(err.to_string())
    })?;

    Ok(file)
}

/// Reads and resolves a pipeline file into a definition.
pub fn load_pipeline(path: &Path) -> Result<PipelineDefinition, Error> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read pipeline config {}: {}",
            path.display(),
            e
        ))
    })?;

    into_definition(parse_yaml(&contents)?)
}

fn step_context(step: &Step) -> Result<ExecutionContext, Error> {
    match (&step.command, &step.procedure) {
        (Some(command), None) => {
            if command.is_empty() {
                return Err(ParseError::InvalidStep {
                    step: step.name.clone(),
                    message: "command must not be empty".to_string(),
                }
                .into());
            }

            Ok(ExecutionContext::LocalProcess(LocalProcessExecutionContext {
                entry_point: vec![command[0].clone()],
                args: command[1..].to_vec(),
                env_vars: step
                    .environment
                    .iter()
                    .map(|kv| (kv.key.clone(), kv.value.clone()))
                    .collect(),
                working_dir: step.working_directory.as_ref().map(Into::into),
                exec_timeout: step.timeout_seconds.map(Duration::from_secs),
            }))
        }
        (None, Some(procedure)) => Ok(ExecutionContext::StoredProcedure(
            StoredProcedureExecutionContext {
                procedure: procedure.clone(),
            },
        )),
        _ => Err(ParseError::InvalidStep {
            step: step.name.clone(),
            message: "exactly one of 'command' or 'procedure' must be set".to_string(),
        }
        .into()),
    }
}

/// Resolves step names into task ids.
pub fn into_definition(file: PipelineFile) -> Result<PipelineDefinition, Error> {
    if file.version != SUPPORTED_VERSION {
        return Err(ParseError::UnsupportedVersion {
            found: file.version,
        }
        .into());
    }

    let pipeline = file.pipeline;
    let interval: ScheduleInterval = pipeline.schedule.parse()?;

    let mut info = PipelineInfo::new(
        &pipeline.name,
        pipeline.description.clone(),
        Schedule {
            interval,
            start_date: pipeline.start_date,
        },
    );
    info.tags = pipeline.tags.clone();
    info.retries = pipeline.retries;
    if let Some(owner) = &pipeline.owner {
        info.owner = owner.clone();
    }

    let all_names: HashSet<&str> = pipeline.steps.iter().map(|s| s.name.as_str()).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut task_definitions = Vec::with_capacity(pipeline.steps.len());
    let mut previous: Option<&str> = None;

    for step in &pipeline.steps {
        if !seen.insert(step.name.as_str()) {
            return Err(ParseError::InvalidStep {
                step: step.name.clone(),
                message: "duplicate step name".to_string(),
            }
            .into());
        }

        let upstream: Vec<&str> = match &step.depends_on {
            Some(names) => names.iter().map(String::as_str).collect(),
            None => previous.into_iter().collect(),
        };

        if let Some(unknown) = upstream.iter().find(|name| !all_names.contains(*name)) {
            return Err(ParseError::InvalidStep {
                step: step.name.clone(),
                message: format!("depends on unknown step '{unknown}'"),
            }
            .into());
        }

        task_definitions.push(TaskDefinition {
            id: TaskDefinition::stable_id(info.id, &step.name),
            pipeline_id: info.id,
            name: step.name.clone(),
            description: step.description.clone(),
            execution_context: step_context(step)?,
            depends_on: upstream
                .iter()
                .map(|name| TaskDefinition::stable_id(info.id, name))
                .collect(),
        });

        previous = Some(step.name.as_str());
    }

    Ok(PipelineDefinition {
        info,
        task_definitions,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid YAML config at line {line}, column {column}: {message}")]
    InvalidYaml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("Invalid YAML config: {message}")]
    InvalidYamlNoLocation { message: String },

    #[error("Invalid step '{step}': {message}")]
    InvalidStep { step: String, message: String },

    #[error("Unsupported pipeline file version '{found}', expected '1'")]
    UnsupportedVersion { found: String },
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::PipelineExecutionGraph;

    const RETAIL_YAML: &str = r#"
version: "1"
pipeline:
  name: retail_etl_pipeline
  description: Retail ETL
  tags: [retail, warehouse]
  schedule: "@daily"
  start_date: 2024-01-01
  steps:
    - name: reset_schema
      command: [python, /opt/scripts/data_truncate.py, /opt/sql/03_ddl_tables.sql]
      timeout_seconds: 600
    - name: generate_sales_data
      command: [python, /opt/scripts/generate_data.py]
      environment:
        - key: ROWS
          value: "1000"
    - name: trigger_stored_procedure
      procedure: pkg_etl_retail.load_daily_sales
"#;

    #[test]
    fn test_linear_steps_chain_by_default() {
        let def = into_definition(parse_yaml(RETAIL_YAML).unwrap()).unwrap();
        let graph = PipelineExecutionGraph::new(&def).unwrap();

        let order: Vec<&str> = graph
            .execution_order()
            .iter()
            .map(|id| graph.get_task_definition(*id).unwrap().name.as_str())
            .collect();
        assert_eq!(
            order,
            vec!["reset_schema", "generate_sales_data", "trigger_stored_procedure"]
        );
        assert_eq!(def.info.tags, vec!["retail", "warehouse"]);
        assert_eq!(def.info.retries, 0);
    }

    #[test]
    fn test_step_contexts() {
        let def = into_definition(parse_yaml(RETAIL_YAML).unwrap()).unwrap();

        match &def.task_definitions[0].execution_context {
            ExecutionContext::LocalProcess(ctx) => {
                assert_eq!(ctx.entry_point, vec!["python"]);
                assert_eq!(ctx.exec_timeout, Some(Duration::from_secs(600)));
            }
            other => panic!("unexpected context {other:?}"),
        }
        match &def.task_definitions[1].execution_context {
            ExecutionContext::LocalProcess(ctx) => {
                assert_eq!(ctx.env_vars.get("ROWS").map(String::as_str), Some("1000"));
            }
            other => panic!("unexpected context {other:?}"),
        }
        assert!(matches!(
            def.task_definitions[2].execution_context,
            ExecutionContext::StoredProcedure(_)
        ));
    }

    #[test]
    fn test_yaml_error_reports_position() {
        let err = parse_yaml("version: \"1\"\npipeline:\n  name: [unterminated\n").unwrap_err();
        assert!(err.to_string().contains("line"));
    }

    #[test]
    fn test_step_needs_exactly_one_executor() {
        let yaml = r#"
version: "1"
pipeline:
  name: broken
  start_date: 2024-01-01
  steps:
    - name: both
      command: ["true"]
      procedure: pkg.load
"#;
        let err = into_definition(parse_yaml(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("exactly one"));
    }

    #[test]
    fn test_retries_are_read() {
        let yaml = RETAIL_YAML.replace("  schedule: \"@daily\"", "  schedule: \"@daily\"\n  retries: 2");
        let def = into_definition(parse_yaml(&yaml).unwrap()).unwrap();
        assert_eq!(def.info.retries, 2);
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let yaml = RETAIL_YAML.replace("version: \"1\"", "version: \"2\"");
        let err = into_definition(parse_yaml(&yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("Unsupported pipeline file version '2'"));
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let yaml = r#"
version: "1"
pipeline:
  name: broken
  start_date: 2024-01-01
  steps:
    - name: load
      procedure: pkg.load
      depends_on: [ghost]
"#;
        let err = into_definition(parse_yaml(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
