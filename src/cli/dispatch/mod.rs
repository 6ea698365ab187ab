use crate::cli::actions::Action;
use crate::config::EngineConfig;
use anyhow::Result;
use std::time::Duration;

pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let config = engine_config(matches)?;

    Ok(Action::Server {
        port: matches.get_one::<u16>("port").copied().unwrap_or(3567),
        dsn: matches
            .get_one("dsn")
            .map(|s: &String| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --dsn"))?,
        config,
    })
}

fn engine_config(matches: &clap::ArgMatches) -> Result<EngineConfig> {
    let string = |id: &str| -> Result<String> {
        matches
            .get_one::<String>(id)
            .map(std::string::ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("missing argument: --{id}"))
    };
    let seconds = |id: &str| -> Result<Duration> {
        matches
            .get_one::<u64>(id)
            .copied()
            .map(Duration::from_secs)
            .ok_or_else(|| anyhow::anyhow!("missing argument: --{id}"))
    };

    let storage_timeout = matches
        .get_one::<u64>("storage-timeout-ms")
        .copied()
        .map(Duration::from_millis)
        .ok_or_else(|| anyhow::anyhow!("missing argument: --storage-timeout-ms"))?;

    Ok(EngineConfig::new()
        .with_cookie_domain(string("cookie-domain")?)
        .with_cookie_secure(matches.get_flag("cookie-secure"))
        .with_cookie_same_site(string("cookie-same-site")?)
        .with_access_token_path(string("access-token-path")?)
        .with_refresh_token_path(string("refresh-token-path")?)
        .with_id_refresh_token_path(string("id-refresh-token-path")?)
        .with_anti_csrf(!matches.get_flag("disable-anti-csrf"))
        .with_access_token_blacklisting(matches.get_flag("access-token-blacklisting"))
        .with_session_expired_status_code(
            matches
                .get_one::<u16>("session-expired-status-code")
                .copied()
                .unwrap_or(440),
        )
        .with_access_token_validity(seconds("access-token-validity")?)
        .with_refresh_token_validity(seconds("refresh-token-validity")?)
        .with_signing_key_validity(seconds("signing-key-validity")?)
        .with_signing_key_grace(seconds("signing-key-grace")?)
        .with_storage_timeout(storage_timeout))
}
