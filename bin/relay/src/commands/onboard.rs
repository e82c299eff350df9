use relay_core::{Config, Paths};

const SOUL_TEMPLATE: &str = "# Soul\n\nYou are a helpful personal assistant reachable over chat.\nKeep replies short and concrete; ask before taking destructive actions.\n";

const TOOLS_TEMPLATE: &str = "# Tools\n\nNotes for the agent about the machine it runs on: available CLIs,\nproject directories, credentials locations. Edit freely.\n";

const MEMORY_TEMPLATE: &str = "# Memory\n\nAnything written outside the markers below is yours and survives\nre-curation.\n\n<!-- relay:auto -->\n<!-- /relay:auto -->\n";

/// Create the config root with a default config and workspace files.
pub async fn run(force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    paths.ensure_dirs()?;

    let config_path = paths.config_file();
    if config_path.exists() && !force {
        println!(
            "Config already exists at {} (use --force to overwrite).",
            config_path.display()
        );
    } else {
        Config::default().save(&config_path)?;
        println!("Wrote default config to {}.", config_path.display());
    }

    for (path, template) in [
        (paths.soul_md(), SOUL_TEMPLATE),
        (paths.tools_md(), TOOLS_TEMPLATE),
        (paths.memory_md(), MEMORY_TEMPLATE),
    ] {
        if !path.exists() {
            std::fs::write(&path, template)?;
            println!("Seeded {}.", path.display());
        }
    }

    println!(
        "\nNext steps:\n  1. Put your bot token in TELEGRAM_BOT_TOKEN or {}.\n  2. Add allowed user ids to allowFrom.\n  3. Run `relay gateway`.",
        config_path.display()
    );
    Ok(())
}
