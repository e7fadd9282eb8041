// Client creation with custom user-agent support for kube 2.x
use crate::error::Result as NcResult;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};
use tracing::warn;

/// Environment variable that overrides the user agent sent to the API server
pub const USER_AGENT_ENV: &str = "NAVICACHE_USER_AGENT";

/// Pick the user agent: environment override first, then the caller's value.
#[must_use]
pub fn resolve_user_agent(custom_user_agent: Option<&str>) -> Option<String> {
    std::env::var(USER_AGENT_ENV)
        .ok()
        .filter(|ua| !ua.trim().is_empty())
        .or_else(|| custom_user_agent.map(str::to_string))
}

/// Add a `user-agent` header to `config`, skipping values that are not valid
/// header text.
pub fn add_user_agent_header(config: &mut Config, user_agent: Option<&str>) {
    let Some(user_agent) = resolve_user_agent(user_agent) else {
        return;
    };

    match HeaderValue::from_str(&user_agent) {
        Ok(header_value) => config
            .headers
            .push((HeaderName::from_static("user-agent"), header_value)),
        Err(e) => warn!("Ignoring invalid user agent '{}': {}", user_agent, e),
    }
}

/// Create a new k8s client to interact with k8s cluster api
///
/// # Errors
///
/// Will return `Err` if the kube config cannot be inferred or the client
/// cannot be built from it
pub async fn new(custom_user_agent: Option<&str>) -> NcResult<Client> {
    let mut config = Config::infer().await?;
    add_user_agent_header(&mut config, custom_user_agent);
    let client = Client::try_from(config)?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_user_agent_prefers_caller_without_env() {
        if std::env::var(USER_AGENT_ENV).is_ok() {
            return;
        }
        assert_eq!(
            resolve_user_agent(Some("navicache/test")).as_deref(),
            Some("navicache/test")
        );
        assert!(resolve_user_agent(None).is_none());
    }
}
