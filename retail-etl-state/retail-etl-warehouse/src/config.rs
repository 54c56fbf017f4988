use std::{fmt, time::Duration};

use strum_macros::{Display, EnumString};
use url::Url;

use crate::{
    error::WarehouseError,
    procedure::{DEFAULT_PROCEDURE, ProcedureName},
};

pub const ENV_USER: &str = "WAREHOUSE_USER";
pub const ENV_PASSWORD: &str = "WAREHOUSE_PASS";
pub const ENV_CONN_STRING: &str = "WAREHOUSE_CONN_STRING";
pub const ENV_BACKEND: &str = "WAREHOUSE_BACKEND";
pub const ENV_CONNECT_TIMEOUT: &str = "WAREHOUSE_CONNECT_TIMEOUT_SECS";
pub const ENV_PROCEDURE: &str = "WAREHOUSE_PROCEDURE";

const DEFAULT_USER: &str = "RETAIL_DW";
const DEFAULT_CONN_STRING: &str = "warehouse-db:5432/retail";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Backend {
    Postgres,
    #[strum(serialize = "mysql")]
    MySql,
    Sqlite,
}

impl Backend {
    fn scheme(&self) -> &'static str {
        match self {
            Backend::Postgres => "postgres",
            Backend::MySql => "mysql",
            Backend::Sqlite => "sqlite",
        }
    }
}

/// Resolves `WAREHOUSE_PROCEDURE`, falling back to the default when unset
/// or blank.
pub fn procedure_from_env() -> Result<ProcedureName, WarehouseError> {
    procedure_from_lookup(|key| std::env::var(key).ok())
}

pub fn procedure_from_lookup<F>(lookup: F) -> Result<ProcedureName, WarehouseError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(ENV_PROCEDURE)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_PROCEDURE.to_string())
        .parse()
}

/// Connection settings for the warehouse the load procedure runs in.
///
/// | Env Var                          | Default                            |
/// |----------------------------------|------------------------------------|
/// | `WAREHOUSE_USER`                 | `RETAIL_DW`                        |
/// | `WAREHOUSE_PASS`                 | required                           |
/// | `WAREHOUSE_CONN_STRING`          | `warehouse-db:5432/retail`         |
/// | `WAREHOUSE_BACKEND`              | `postgres`                         |
/// | `WAREHOUSE_CONNECT_TIMEOUT_SECS` | `30`                               |
/// | `WAREHOUSE_PROCEDURE`            | `pkg_etl_retail.load_daily_sales`  |
///
/// The password has no fallback. For the `sqlite` backend the connection
/// string is the database path and no password is needed.
#[derive(Clone)]
pub struct WarehouseConfig {
    pub user: String,
    pub password: String,
    pub connect_string: String,
    pub backend: Backend,
    pub connect_timeout: Duration,
    pub procedure: ProcedureName,
}

impl fmt::Debug for WarehouseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("connect_string", &self.connect_string)
            .field("backend", &self.backend)
            .field("connect_timeout", &self.connect_timeout)
            .field("procedure", &self.procedure)
            .finish()
    }
}

impl WarehouseConfig {
    pub fn from_env() -> Result<Self, WarehouseError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Set values
    /// take precedence over the defaults; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, WarehouseError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match get(ENV_BACKEND) {
            Some(raw) => raw.parse::<Backend>().map_err(|_| {
                WarehouseError::Config(format!(
                    "{ENV_BACKEND} must be one of postgres, mysql, sqlite (got '{raw}')"
                ))
            })?,
            None => Backend::Postgres,
        };

        let password = match (get(ENV_PASSWORD), backend) {
            (Some(password), _) => password,
            (None, Backend::Sqlite) => String::new(),
            (None, _) => {
                return Err(WarehouseError::Config(format!("{ENV_PASSWORD} must be set")));
            }
        };

        let connect_timeout_secs = match get(ENV_CONNECT_TIMEOUT) {
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                WarehouseError::Config(format!(
                    "{ENV_CONNECT_TIMEOUT} must be a whole number of seconds (got '{raw}')"
                ))
            })?,
            None => DEFAULT_CONNECT_TIMEOUT_SECS,
        };

        let procedure = procedure_from_lookup(&lookup)?;

        Ok(Self {
            user: get(ENV_USER).unwrap_or_else(|| DEFAULT_USER.to_string()),
            password,
            connect_string: get(ENV_CONN_STRING).unwrap_or_else(|| DEFAULT_CONN_STRING.to_string()),
            backend,
            connect_timeout: Duration::from_secs(connect_timeout_secs),
            procedure,
        })
    }

    /// Connection URL including credentials. Never log this value.
    pub fn connection_url(&self) -> Result<String, WarehouseError> {
        if self.backend == Backend::Sqlite {
            return Ok(format!("sqlite:{}", self.connect_string));
        }

        let mut url = Url::parse(&format!("{}://{}", self.backend.scheme(), self.connect_string))
            .map_err(|e| {
                WarehouseError::Config(format!(
                    "Invalid connection string '{}': {e}",
                    self.connect_string
                ))
            })?;

        url.set_username(&self.user)
            .map_err(|_| WarehouseError::Config("Cannot set user on connection URL".to_string()))?;
        url.set_password(Some(&self.password)).map_err(|_| {
            WarehouseError::Config("Cannot set password on connection URL".to_string())
        })?;

        Ok(url.to_string())
    }

    /// Credential-free description of the target, for logs and errors.
    pub fn target(&self) -> String {
        match self.backend {
            Backend::Sqlite => format!("sqlite:{}", self.connect_string),
            backend => format!("{}://{}@{}", backend.scheme(), self.user, self.connect_string),
        }
    }
}
