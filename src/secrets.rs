use crate::{
    aws_credentials::{self, basic_runtime},
    config::Config,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use rusoto_core::Region;
use rusoto_kms::{DecryptRequest, Kms, KmsClient};
use slog::{info, Logger};
use std::{collections::HashMap, env};
use tokio::runtime::Runtime;
use url::Url;

/// Name of the encryption context key bound into the KMS ciphertexts. The
/// deployment encrypts the endpoint and token against the consuming
/// function's name, so decryption outside that function fails closed.
const ENCRYPTION_CONTEXT_KEY: &str = "LambdaFunctionName";

/// Environment variable carrying the managed environment's function name.
const FUNCTION_NAME_VAR: &str = "AWS_LAMBDA_FUNCTION_NAME";

/// The outbound endpoint and bearer token after any decryption has been
/// applied. Resolved once at process start; read-only thereafter.
#[derive(Debug, Clone)]
pub struct ResolvedSecrets {
    pub endpoint: Url,
    pub token: String,
}

/// Decrypts opaque secret ciphertexts. Implemented against AWS KMS in
/// production; tests substitute a fake.
pub trait SecretDecrypter {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// SecretDecrypter backed by AWS KMS, scoping decryption to this function's
/// name via EncryptionContext.
pub struct KmsSecretDecrypter {
    client: KmsClient,
    runtime: Runtime,
    function_name: String,
}

impl KmsSecretDecrypter {
    /// Constructs a decrypter for the current managed environment. Fails if
    /// the function name is not present in the environment or the AWS client
    /// cannot be built.
    pub fn new() -> Result<KmsSecretDecrypter> {
        let function_name = env::var(FUNCTION_NAME_VAR)
            .map_err(|_| anyhow!("{} must be set to decrypt secrets", FUNCTION_NAME_VAR))?;
        let credentials = aws_credentials::DefaultCredentialsProvider::new()
            .context("failed to construct AWS credentials provider")?;
        let client = KmsClient::new_with(
            aws_credentials::http_client().context("failed to construct KMS HTTP client")?,
            credentials,
            Region::default(),
        );
        Ok(KmsSecretDecrypter {
            client,
            runtime: basic_runtime()?,
            function_name,
        })
    }
}

impl SecretDecrypter for KmsSecretDecrypter {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut encryption_context = HashMap::new();
        encryption_context.insert(
            ENCRYPTION_CONTEXT_KEY.to_owned(),
            self.function_name.clone(),
        );

        let request = DecryptRequest {
            ciphertext_blob: Bytes::copy_from_slice(ciphertext),
            encryption_context: Some(encryption_context),
            ..Default::default()
        };

        let output = aws_credentials::retry_request("decrypt secret", || {
            self.runtime.block_on(self.client.decrypt(request.clone()))
        })
        .context("KMS decryption failed")?;

        output
            .plaintext
            .map(|b| b.to_vec())
            .ok_or_else(|| anyhow!("KMS decryption returned no plaintext"))
    }
}

/// Resolves the outbound endpoint and bearer token from the provided
/// configuration. When encryption is enabled and the process runs in the
/// managed environment, both values are base64-decoded and decrypted;
/// otherwise they are taken verbatim. Failures here are fatal to startup.
pub fn resolve_secrets(
    config: &Config,
    decrypter: Option<&dyn SecretDecrypter>,
    logger: &Logger,
) -> Result<ResolvedSecrets> {
    let (endpoint_raw, token) = if config.use_encryption && config.managed_environment {
        let decrypter =
            decrypter.ok_or_else(|| anyhow!("encryption requested but no decrypter available"))?;
        info!(logger, "decrypting endpoint and token via KMS");
        (
            decrypt_string(decrypter, &config.endpoint).context("failed to decrypt endpoint")?,
            decrypt_string(decrypter, &config.api_token).context("failed to decrypt API token")?,
        )
    } else {
        (config.endpoint.clone(), config.api_token.clone())
    };

    let endpoint = Config::endpoint_url(endpoint_raw.trim())?;
    Ok(ResolvedSecrets {
        endpoint,
        token: token.trim().to_owned(),
    })
}

fn decrypt_string(decrypter: &dyn SecretDecrypter, value: &str) -> Result<String> {
    let ciphertext = BASE64
        .decode(value.trim())
        .context("secret is not valid base64")?;
    let plaintext = decrypter.decrypt(&ciphertext)?;
    String::from_utf8(plaintext).context("decrypted secret is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;

    struct Rot13Decrypter;

    impl SecretDecrypter for Rot13Decrypter {
        fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
            Ok(ciphertext
                .iter()
                .map(|b| match b {
                    b'a'..=b'z' => (b - b'a' + 13) % 26 + b'a',
                    b'A'..=b'Z' => (b - b'A' + 13) % 26 + b'A',
                    other => *other,
                })
                .collect())
        }
    }

    fn config_with(endpoint: &str, token: &str, encrypted: bool) -> Config {
        Config {
            endpoint: endpoint.to_owned(),
            api_token: token.to_owned(),
            use_encryption: encrypted,
            managed_environment: encrypted,
            region_fallback: None,
            vpc_log_group: None,
            verbose: false,
            debug_interval: 100,
            flow_log_cache_ttl: std::time::Duration::from_secs(600),
        }
    }

    #[test]
    fn plaintext_passthrough() {
        let logger = setup_test_logging();
        let config = config_with("https://otel.example.com", "secret-token", false);
        let resolved = resolve_secrets(&config, None, &logger).unwrap();
        assert_eq!(resolved.endpoint.as_str(), "https://otel.example.com/");
        assert_eq!(resolved.token, "secret-token");
    }

    #[test]
    fn decrypted_values() {
        let logger = setup_test_logging();
        // rot13("uggcf") == "https"; the decrypter undoes the rotation.
        let endpoint_ciphertext = BASE64.encode("uggcf://bgry.rknzcyr.pbz");
        let token_ciphertext = BASE64.encode("frperg-gbxra");
        let config = config_with(&endpoint_ciphertext, &token_ciphertext, true);

        let resolved = resolve_secrets(&config, Some(&Rot13Decrypter), &logger).unwrap();
        assert_eq!(resolved.endpoint.as_str(), "https://otel.example.com/");
        assert_eq!(resolved.token, "secret-token");
    }

    #[test]
    fn invalid_base64_is_fatal() {
        let logger = setup_test_logging();
        let config = config_with("!!not-base64!!", "also bad", true);
        resolve_secrets(&config, Some(&Rot13Decrypter), &logger).unwrap_err();
    }

    #[test]
    fn bad_endpoint_url_is_fatal() {
        let logger = setup_test_logging();
        let config = config_with("not a url", "token", false);
        resolve_secrets(&config, None, &logger).unwrap_err();
    }
}
