mod cli;

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let (result, drain) = runtime.block_on(cli::app::run());
    // Abandoned policy evaluations may still hold blocking threads.
    runtime.shutdown_timeout(drain);
    result
}
