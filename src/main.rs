use std::path::PathBuf;

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a path"))?;
                config_path = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("Usage: dashcam [--config <path>]");
                return Ok(());
            }
            other => anyhow::bail!("unknown argument: {}", other),
        }
    }

    let config_path = config_path.unwrap_or_else(dashcam_lib::config::get_default_config_path);
    dashcam_lib::run(&config_path)
}
