//! `tangle server` - Start the Tangle HTTP server.

use super::StateOptions;

pub async fn run(host: String, port: u16, options: &StateOptions) -> Result<(), String> {
    let config = options.server_config(host.clone(), port);

    println!("Starting Tangle server on {}:{}...", host, port);

    let state = tangle_server::create_app_state(&config).await?;
    let addr = tangle_server::start_server_with_state(config, state.clone()).await?;
    println!("Tangle server listening on http://{}", addr);

    // Keep the process running until interrupted
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for Ctrl+C: {}", e))?;

    println!("\nShutting down...");
    state.shutdown().await;
    Ok(())
}
