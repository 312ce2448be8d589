#[tokio::main]
async fn main() -> anyhow::Result<()> {
    session_grader::run().await?;
    Ok(())
}
