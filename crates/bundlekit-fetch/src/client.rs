use std::error::Error as StdError;
use std::time::Duration;

use anyhow::{Context, Result};
use bundlekit_core::{NetworkConfig, UpdateError};
use reqwest::blocking::Client;

pub fn build_http_client(network: &NetworkConfig) -> Result<Client> {
    Client::builder()
        .user_agent(network.user_agent.clone())
        .connect_timeout(Duration::from_secs(network.connect_timeout_secs))
        .timeout(Duration::from_secs(network.request_timeout_secs))
        .build()
        .context("failed to build HTTP client")
}

pub(crate) fn network_error(url: &str, err: &dyn StdError) -> UpdateError {
    UpdateError::Network {
        url: url.to_string(),
        message: describe(err),
    }
}

fn describe(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.contains(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}
