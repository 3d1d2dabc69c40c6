use anyhow::Result;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum BackendCommands {
    /// Start the replication service
    Server,
    /// Check backend configuration, including every replication policy
    CheckConfig,
}

pub async fn handle_backend_command(cmd: BackendCommands) -> Result<()> {
    match cmd {
        BackendCommands::Server => {
            let settings = crate::server::settings::Settings::new()?;
            crate::server::run_server(settings).await
        }
        BackendCommands::CheckConfig => {
            println!("Checking backend configuration...");
            match crate::server::settings::Settings::new() {
                Ok(settings) => {
                    println!("✓ Configuration is valid");
                    println!("  Registries: {}", settings.registries.len());
                    println!("  Policies:   {}", settings.policies.len());
                    Ok(())
                }
                Err(e) => {
                    eprintln!("✗ Configuration error: {:#}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}
