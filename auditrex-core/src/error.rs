use sqlx::postgres::PgDatabaseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("database error: {0}")]
    Database(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("error decoding upstream response: {0}")]
    Decode(String),

    #[error("error shipping event: {0}")]
    Ship(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AuditError>;

impl AuditError {
    /// Flatten a sqlx error into a `Database` variant. Postgres server errors
    /// carry message, detail, hint and where fields; all of them end up in
    /// the rendered message.
    pub fn database(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if let Some(pg) = db_err.try_downcast_ref::<PgDatabaseError>() {
                let mut msg = pg.message().to_string();
                for part in [pg.detail(), pg.hint(), pg.r#where()].into_iter().flatten() {
                    msg.push_str(": ");
                    msg.push_str(part);
                }
                return AuditError::Database(msg);
            }
        }
        AuditError::Database(err.to_string())
    }
}
