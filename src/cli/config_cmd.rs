//! Configuration commands.

use ratequeue::DispatchConfig;

/// Print the effective configuration. The authorization value is never shown.
pub fn cmd_config_show(config: &DispatchConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    if config.authorization.is_some() {
        println!("# authorization is set (hidden)");
    }
    Ok(())
}
