//! Process configuration, loaded once at startup from the environment.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub encryption_key: String,
    pub next_public_base_url: String,
    pub run_integration_tests: bool,
    pub run_trading_integration_tests: bool,
    pub performance_test: bool,
    pub http_port: u16,
    pub testnet_credentials: TestnetCredentials,
}

/// Optional per-venue testnet creds, only consulted by integration tests
/// gated behind `RUN_INTEGRATION_TESTS`/`RUN_TRADING_INTEGRATION_TESTS`.
#[derive(Debug, Clone, Default)]
pub struct TestnetCredentials {
    pub binance: Option<(String, String)>,
    pub okx: Option<(String, String, String)>,
    pub gateio: Option<(String, String)>,
    pub mexc: Option<(String, String)>,
    pub bingx: Option<(String, String)>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "funding_arb.sqlite3".to_string());
        let encryption_key = env::var("ENCRYPTION_KEY").unwrap_or_default();
        let next_public_base_url =
            env::var("NEXT_PUBLIC_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".into());
        let run_integration_tests = env_flag("RUN_INTEGRATION_TESTS");
        let run_trading_integration_tests = env_flag("RUN_TRADING_INTEGRATION_TESTS");
        let performance_test = env_flag("PERFORMANCE_TEST");
        let http_port = env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);

        let testnet_credentials = TestnetCredentials {
            binance: env_pair("BINANCE_TESTNET_KEY", "BINANCE_TESTNET_SECRET"),
            okx: env_triple(
                "OKX_TESTNET_KEY",
                "OKX_TESTNET_SECRET",
                "OKX_TESTNET_PASSPHRASE",
            ),
            gateio: env_pair("GATEIO_TESTNET_KEY", "GATEIO_TESTNET_SECRET"),
            mexc: env_pair("MEXC_TESTNET_KEY", "MEXC_TESTNET_SECRET"),
            bingx: env_pair("BINGX_TESTNET_KEY", "BINGX_TESTNET_SECRET"),
        };

        Ok(Self {
            database_url,
            encryption_key,
            next_public_base_url,
            run_integration_tests,
            run_trading_integration_tests,
            performance_test,
            http_port,
            testnet_credentials,
        })
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"))
        .unwrap_or(false)
}

fn env_pair(key_var: &str, secret_var: &str) -> Option<(String, String)> {
    let key = env::var(key_var).ok()?;
    let secret = env::var(secret_var).ok()?;
    Some((key, secret))
}

fn env_triple(key_var: &str, secret_var: &str, pass_var: &str) -> Option<(String, String, String)> {
    let key = env::var(key_var).ok()?;
    let secret = env::var(secret_var).ok()?;
    let pass = env::var(pass_var).ok()?;
    Some((key, secret, pass))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_flag_accepts_common_truthy_values() {
        env::set_var("TEST_FLAG_ONE", "true");
        assert!(env_flag("TEST_FLAG_ONE"));
        env::remove_var("TEST_FLAG_ONE");
        assert!(!env_flag("TEST_FLAG_ONE"));
    }

    #[test]
    fn env_pair_requires_both_vars() {
        env::remove_var("TEST_PAIR_KEY");
        env::remove_var("TEST_PAIR_SECRET");
        assert!(env_pair("TEST_PAIR_KEY", "TEST_PAIR_SECRET").is_none());
        env::set_var("TEST_PAIR_KEY", "k");
        env::set_var("TEST_PAIR_SECRET", "s");
        assert_eq!(
            env_pair("TEST_PAIR_KEY", "TEST_PAIR_SECRET"),
            Some(("k".to_string(), "s".to_string()))
        );
        env::remove_var("TEST_PAIR_KEY");
        env::remove_var("TEST_PAIR_SECRET");
    }
}
