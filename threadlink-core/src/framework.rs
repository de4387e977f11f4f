use sqlx::PgPool;

/// Runs [`kanau::processor::Processor`] queries against the connection pool.
#[derive(Clone)]
pub struct DatabaseProcessor {
    pub pool: PgPool,
}
