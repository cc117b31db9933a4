//! Kubernetes client construction and naming helpers

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest name accepted for DNS-label based objects (Services, Jobs' pods)
pub const MAX_DNS_LABEL_LEN: usize = 63;

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from an optional kubeconfig path with custom timeouts
///
/// Without a path the config is inferred (in-cluster service account, then
/// `KUBECONFIG`, then `~/.kube/config`).
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context("create_client", format!("failed to read kubeconfig: {e}"))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context("create_client", format!("failed to load kubeconfig: {e}"))
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {e}"))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {e}"))
    })
}

/// Hex-encoded SHA-256 digest of `input`
///
/// Stable across toolchains, so it is safe to persist in annotations.
pub fn sha256_hex(input: &[u8]) -> String {
    use aws_lc_rs::digest;
    hex_encode(digest::digest(&digest::SHA256, input).as_ref())
}

/// First 16 hex chars of the SHA-256 digest of `input`
pub fn short_hash(input: &str) -> String {
    let mut full = sha256_hex(input.as_bytes());
    full.truncate(16);
    full
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Join name parts with `-`, shortening the result to a valid DNS label.
///
/// Over-long names keep a prefix and gain a hash suffix of the full name, so
/// distinct inputs stay distinct.
pub fn dns_label(parts: &[&str]) -> String {
    let joined = parts.join("-");
    if joined.len() <= MAX_DNS_LABEL_LEN {
        return joined;
    }
    let suffix = &short_hash(&joined)[..8];
    let mut prefix_len = MAX_DNS_LABEL_LEN - suffix.len() - 1;
    while !joined.is_char_boundary(prefix_len) {
        prefix_len -= 1;
    }
    let prefix = joined[..prefix_len].trim_end_matches('-');
    format!("{prefix}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn short_hash_is_a_prefix() {
        assert_eq!(short_hash("abc"), "ba7816bf8f01cfea");
    }

    #[test]
    fn dns_label_passes_short_names_through() {
        assert_eq!(dns_label(&["run-42", "build"]), "run-42-build");
    }

    #[test]
    fn dns_label_shortens_long_names_deterministically() {
        let long = "a".repeat(80);
        let first = dns_label(&[&long, "build"]);
        let second = dns_label(&[&long, "deploy"]);
        assert!(first.len() <= MAX_DNS_LABEL_LEN);
        assert_ne!(first, second);
        assert_eq!(first, dns_label(&[&long, "build"]));
    }
}
