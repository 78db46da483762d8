use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "shepherd container supervision daemon")]
pub struct Args {
    /// Sub‑commands (run, status)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Normal daemon operation (default if no sub‑command)
    Run {
        /// Path to configuration file
        #[arg(long, short = 'c')]
        config: Option<String>,
    },
    /// Print the reconciled state of every container on disk
    Status {
        /// Path to configuration file
        #[arg(long, short = 'c')]
        config: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_is_optional() {
        let args = Args::try_parse_from(["shepherd"]).unwrap();
        assert!(args.sub.is_none());

        let args = Args::try_parse_from(["shepherd", "status", "-c", "/tmp/s.toml"]).unwrap();
        match args.sub {
            Some(Cmd::Status { config }) => assert_eq!(config.as_deref(), Some("/tmp/s.toml")),
            other => panic!("unexpected subcommand: {other:?}"),
        }
    }
}
