//! Sandbox-runtime entry point. Runs inside the `code-sandbox` image
//! against the staged inputs under the scratch mount; the report JSON is
//! the only thing written to stdout, everything else goes to stderr.

use std::io::Write;
use std::path::PathBuf;

use tradecell::sandbox;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let input_dir = std::env::var("HOST_TMPFS_BIND")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/host_tmpfs"));

    tracing::info!(dir = %input_dir.display(), "starting backtest execution");

    match sandbox::execute(&input_dir) {
        Ok(result) => {
            let json = match serde_json::to_string(&result) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize report");
                    std::process::exit(sandbox::EXIT_USER_FAULT);
                }
            };
            let mut stdout = std::io::stdout();
            if stdout
                .write_all(json.as_bytes())
                .and_then(|()| stdout.flush())
                .is_err()
            {
                std::process::exit(sandbox::EXIT_USER_FAULT);
            }
        }
        Err(e) => {
            // The dispatcher surfaces stderr to the caller, so the
            // rejection reason must be readable there.
            eprintln!("{e}");
            tracing::error!(error = %e, "execution failed");
            std::process::exit(e.exit_code());
        }
    }
}
