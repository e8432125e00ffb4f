use anyhow::{bail, Result};
use argh::FromArgs;
use log::LevelFilter;

#[derive(FromArgs, PartialEq, Debug)]
/// Maintain partial local mirrors of Debian-style APT repositories
pub(crate) struct Args {
    /// specify the location of the JSON mirrors configuration
    #[argh(option, short = 'c')]
    pub config: String,
    /// integer logging threshold (10 debug, 20 info, 30 warning, 40 error)
    #[argh(option, default = "30")]
    pub log_level: i32,
    /// remove the Valid-Until field from Release files; requires a
    /// resigning key
    #[argh(switch)]
    pub remove_valid_until: bool,
    /// path to the private OpenPGP key used to re-sign rewritten Release
    /// files
    #[argh(option)]
    pub resign_key: Option<String>,
    /// passphrase of the resigning key
    #[argh(option)]
    pub key_passphrase: Option<String>,
    /// also write an APT sources.list covering the configured mirrors
    #[argh(option, short = 'o')]
    pub sources_list: Option<String>,
}

pub(crate) fn validate(args: &Args) -> Result<()> {
    if args.remove_valid_until && args.resign_key.is_none() {
        bail!("--remove-valid-until requires --resign-key");
    }
    if args.resign_key.is_some() && args.key_passphrase.is_none() {
        bail!("--resign-key requires --key-passphrase");
    }

    Ok(())
}

pub(crate) fn level_filter(threshold: i32) -> LevelFilter {
    match threshold {
        i32::MIN..=10 => LevelFilter::Debug,
        11..=20 => LevelFilter::Info,
        21..=30 => LevelFilter::Warn,
        _ => LevelFilter::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> Args {
        Args {
            config: "mirrors.json".to_string(),
            log_level: 30,
            remove_valid_until: false,
            resign_key: None,
            key_passphrase: None,
            sources_list: None,
        }
    }

    #[test]
    fn test_flag_validation() {
        assert!(validate(&args()).is_ok());

        let mut bad = args();
        bad.remove_valid_until = true;
        assert!(validate(&bad).is_err());

        let mut bad = args();
        bad.resign_key = Some("key.asc".to_string());
        assert!(validate(&bad).is_err());

        let mut good = args();
        good.remove_valid_until = true;
        good.resign_key = Some("key.asc".to_string());
        good.key_passphrase = Some("secret".to_string());
        assert!(validate(&good).is_ok());
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter(10), LevelFilter::Debug);
        assert_eq!(level_filter(20), LevelFilter::Info);
        assert_eq!(level_filter(30), LevelFilter::Warn);
        assert_eq!(level_filter(50), LevelFilter::Error);
    }
}
