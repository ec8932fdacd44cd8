use anyhow::Result;
use kahu_repository::RunRegistry;
use std::env;

#[tokio::main]
async fn main() -> Result<()> {
    let database_url = env::var("DATABASE_URL")?;
    let registry = RunRegistry::connect(&database_url, 5).await?;
    registry.run_migrations().await?;
    Ok(())
}
