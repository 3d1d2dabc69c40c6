use anyhow::Result;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, Table};

use super::ApiClient;
use crate::replication::model::Registry;
use crate::replication::policy::Policy;

#[derive(Debug, Clone, clap::Subcommand)]
pub enum PolicyCommands {
    /// List replication policies
    #[command(visible_alias = "ls")]
    List,
}

pub async fn handle_policy_command(client: &ApiClient, cmd: PolicyCommands) -> Result<()> {
    match cmd {
        PolicyCommands::List => list_policies(client).await,
    }
}

fn registry_label(registry: Option<&Registry>) -> String {
    registry
        .map(|r| format!("{} ({})", r.name, r.url))
        .unwrap_or_else(|| "local".to_string())
}

pub fn policy_table(policies: &[Policy]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("ID").add_attribute(Attribute::Bold),
            Cell::new("NAME").add_attribute(Attribute::Bold),
            Cell::new("SOURCE").add_attribute(Attribute::Bold),
            Cell::new("DESTINATION").add_attribute(Attribute::Bold),
            Cell::new("TRIGGER").add_attribute(Attribute::Bold),
            Cell::new("ENABLED").add_attribute(Attribute::Bold),
        ]);

    for policy in policies {
        let trigger = match policy.trigger.as_ref().and_then(|t| t.cron()) {
            Some(cron) => format!("{} ({})", policy.trigger_type(), cron),
            None => policy.trigger_type().to_string(),
        };
        table.add_row(vec![
            Cell::new(policy.id),
            Cell::new(&policy.name),
            Cell::new(registry_label(policy.src_registry.as_ref())),
            Cell::new(registry_label(policy.dest_registry.as_ref())),
            Cell::new(trigger),
            Cell::new(if policy.enabled { "yes" } else { "no" }),
        ]);
    }
    table
}

async fn list_policies(client: &ApiClient) -> Result<()> {
    let policies: Vec<Policy> = client.get("/policies").await?;
    if policies.is_empty() {
        println!("No replication policies configured.");
    } else {
        println!("{}", policy_table(&policies));
    }
    Ok(())
}
