//! S/MIME signing of outgoing messages.
//!
//! Runs the eligibility check, looks up the sender's credential bundle and
//! hands the message to a [`Signer`]. Skipped messages flow through the
//! pipeline unsigned, signing failures are returned to the caller.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    Credential, CredentialStore, Eligibility, MessageTransformer, OpensslSigner, OutgoingMessage,
    Signer, SigningPolicy, SkipReason, SmimeConfig, TransformError, TransformFuture,
    TransformResult,
};

/// Outcome of signing a single message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningOutcome {
    /// The signed message replacing the original one.
    Signed(Vec<u8>),
    /// The message is not signed and passes through unchanged.
    Skipped(SkipReason),
}

/// Transformer replacing eligible messages with their S/MIME signed form.
pub struct SmimeSignTransformer {
    policy: SigningPolicy,
    credentials: CredentialStore,
    signer: Arc<dyn Signer>,
}

impl SmimeSignTransformer {
    /// Creates a new [`SmimeSignTransformer`] from its three collaborators.
    pub fn new(
        policy: SigningPolicy,
        credentials: CredentialStore,
        signer: Arc<dyn Signer>,
    ) -> Self {
        info!(
            allowed = policy.allowed().len(),
            cert_dir = %credentials.base_dir().display(),
            signer = signer.name(),
            "S/MIME sign transformer initialized"
        );
        Self {
            policy,
            credentials,
            signer,
        }
    }

    /// Creates a new [`SmimeSignTransformer`] signing through OpenSSL as
    /// described by the configuration, `shutdown` cancels in-flight signing.
    pub fn from_config(config: &SmimeConfig, shutdown: CancellationToken) -> Self {
        let signer: OpensslSigner = config.signer().with_shutdown(shutdown);
        Self::new(config.policy(), config.credentials(), Arc::new(signer))
    }

    /// Decides whether the message is signed and, if so, signs it.
    ///
    /// The message itself is left untouched, see
    /// [`transform`](MessageTransformer::transform) for the in-place variant.
    pub async fn sign_message(
        &self,
        message: &OutgoingMessage,
    ) -> TransformResult<SigningOutcome> {
        let sender = match self.policy.evaluate(&message.from, message.header("From")) {
            Eligibility::Eligible(sender) => sender,
            Eligibility::Skip(reason) => {
                info!(
                    message_id = %message.message_id,
                    reason = %reason,
                    "Skipping S/MIME signing"
                );
                return Ok(SigningOutcome::Skipped(reason));
            }
        };

        let credential = self.credentials.resolve(&sender).await.map_err(|e| {
            error!(
                message_id = %message.message_id,
                sender = %sender,
                error = %e,
                "Failed to look up certificate"
            );
            TransformError::Credential(e)
        })?;
        let bundle = match credential {
            Credential::Found(path) => path,
            Credential::NotFound(path) => {
                let reason = SkipReason::CredentialNotFound { sender, path };
                info!(
                    message_id = %message.message_id,
                    reason = %reason,
                    "Skipping S/MIME signing"
                );
                return Ok(SigningOutcome::Skipped(reason));
            }
        };

        info!(
            message_id = %message.message_id,
            sender = %sender,
            bundle = %bundle.display(),
            "Using certificate"
        );
        let signed = self
            .signer
            .sign(message.raw(), &bundle)
            .await
            .map_err(|e| {
                error!(
                    message_id = %message.message_id,
                    sender = %sender,
                    error = %e,
                    "S/MIME signing failed"
                );
                TransformError::Signing(e)
            })?;
        info!(
            message_id = %message.message_id,
            sender = %sender,
            rcpts = message.rcpts.len(),
            bytes_in = message.raw().len(),
            bytes_out = signed.len(),
            "Signed message"
        );
        Ok(SigningOutcome::Signed(signed))
    }
}

impl MessageTransformer for SmimeSignTransformer {
    fn transform<'a>(&'a self, message: &'a mut OutgoingMessage) -> TransformFuture<'a> {
        Box::pin(async move {
            if let SigningOutcome::Signed(signed) = self.sign_message(message).await? {
                message.replace_signed(signed);
            }
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "smime_sign"
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use tempfile::TempDir;

    use super::*;
    use crate::{SignError, SignFuture};

    /// Signer prefixing the body, counting its invocations.
    #[derive(Default)]
    struct PrefixSigner {
        calls: AtomicUsize,
    }

    impl Signer for PrefixSigner {
        fn sign<'a>(&'a self, body: &'a [u8], bundle: &'a Path) -> SignFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let name = bundle.file_name().unwrap().to_string_lossy();
                let mut signed = format!("signed-by:{name}\r\n").into_bytes();
                signed.extend_from_slice(body);
                Ok(signed)
            })
        }

        fn name(&self) -> &str {
            "prefix"
        }
    }

    struct FailingSigner;

    impl Signer for FailingSigner {
        fn sign<'a>(&'a self, _body: &'a [u8], _bundle: &'a Path) -> SignFuture<'a> {
            Box::pin(async move {
                Err(SignError::Process {
                    code: Some(1),
                    stderr: "unable to load certificate".to_string(),
                })
            })
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    const RAW: &[u8] = b"From: Alice <alice@example.com>\r\nSubject: Hi\r\n\r\nHello";

    fn cert_dir(senders: &[&str]) -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        for sender in senders {
            let name = crate::bundle_file_name(sender, "p12");
            std::fs::write(temp_dir.path().join(name), b"bundle").unwrap();
        }
        temp_dir
    }

    fn transformer(
        allowed: &[&str],
        dir: &TempDir,
        signer: Arc<dyn Signer>,
    ) -> SmimeSignTransformer {
        SmimeSignTransformer::new(
            SigningPolicy::new(allowed.iter().copied()),
            CredentialStore::new(dir.path(), "p12"),
            signer,
        )
    }

    #[tokio::test]
    async fn test_sign_eligible_message() {
        let dir = cert_dir(&["alice@example.com"]);
        let signer = Arc::new(PrefixSigner::default());
        let transformer = transformer(&["alice@example.com"], &dir, signer.clone());
        let mut message = OutgoingMessage::from_raw("Alice@Example.com", "bob@example.org", RAW);

        transformer.transform(&mut message).await.unwrap();

        let mut expected = b"signed-by:alice_example_com.p12\r\n".to_vec();
        expected.extend_from_slice(RAW);
        assert!(message.is_signed());
        assert_eq!(message.raw(), expected.as_slice());
        assert_eq!(message.original_raw(), RAW);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skip_on_sender_mismatch() {
        let dir = cert_dir(&["alice@example.com", "mallory@example.com"]);
        let signer = Arc::new(PrefixSigner::default());
        let transformer = transformer(
            &["alice@example.com", "mallory@example.com"],
            &dir,
            signer.clone(),
        );
        let message = OutgoingMessage::from_raw("mallory@example.com", "bob@example.org", RAW);

        let outcome = transformer.sign_message(&message).await.unwrap();

        assert_eq!(
            outcome,
            SigningOutcome::Skipped(SkipReason::SenderMismatch {
                header: "alice@example.com".to_string(),
                envelope: "mallory@example.com".to_string(),
            })
        );
        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skip_on_missing_header() {
        let dir = cert_dir(&["alice@example.com"]);
        let transformer = transformer(
            &["alice@example.com"],
            &dir,
            Arc::new(PrefixSigner::default()),
        );
        let mut message = OutgoingMessage::from_raw(
            "alice@example.com",
            "bob@example.org",
            b"Subject: No sender\r\n\r\nHello",
        );

        let outcome = transformer.sign_message(&message).await.unwrap();
        assert_eq!(outcome, SigningOutcome::Skipped(SkipReason::MissingHeader));

        transformer.transform(&mut message).await.unwrap();
        assert!(!message.is_signed());
        assert_eq!(message.raw(), b"Subject: No sender\r\n\r\nHello");
    }

    #[tokio::test]
    async fn test_skip_when_not_allowed() {
        let dir = cert_dir(&["alice@example.com"]);
        let transformer = transformer(
            &["carol@example.com"],
            &dir,
            Arc::new(PrefixSigner::default()),
        );
        let message = OutgoingMessage::from_raw("alice@example.com", "bob@example.org", RAW);

        let outcome = transformer.sign_message(&message).await.unwrap();

        assert_eq!(
            outcome,
            SigningOutcome::Skipped(SkipReason::NotAllowed {
                sender: "alice@example.com".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_skip_with_empty_allow_list() {
        let dir = cert_dir(&["alice@example.com"]);
        let signer = Arc::new(PrefixSigner::default());
        let transformer = transformer(&[], &dir, signer.clone());
        let mut message = OutgoingMessage::from_raw("alice@example.com", "bob@example.org", RAW);

        transformer.transform(&mut message).await.unwrap();

        assert!(!message.is_signed());
        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skip_when_bundle_missing() {
        let dir = cert_dir(&[]);
        let signer = Arc::new(PrefixSigner::default());
        let transformer = transformer(&["alice@example.com"], &dir, signer.clone());
        let message = OutgoingMessage::from_raw("alice@example.com", "bob@example.org", RAW);

        let outcome = transformer.sign_message(&message).await.unwrap();

        assert_eq!(
            outcome,
            SigningOutcome::Skipped(SkipReason::CredentialNotFound {
                sender: "alice@example.com".to_string(),
                path: dir.path().join("alice_example_com.p12"),
            })
        );
        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_signing_failure_is_reported() {
        let dir = cert_dir(&["alice@example.com"]);
        let transformer = transformer(&["alice@example.com"], &dir, Arc::new(FailingSigner));
        let mut message = OutgoingMessage::from_raw("alice@example.com", "bob@example.org", RAW);

        let result = transformer.transform(&mut message).await;

        match result {
            Err(TransformError::Signing(SignError::Process { stderr, .. })) => {
                assert!(stderr.contains("unable to load certificate"));
            }
            other => panic!("Expected signing failure, got {other:?}"),
        }
        assert!(!message.is_signed());
        assert_eq!(message.raw(), RAW);
    }

    #[tokio::test]
    async fn test_apply_stops_on_failure() {
        let dir = cert_dir(&["alice@example.com"]);
        let transformers: Vec<Box<dyn MessageTransformer>> = vec![
            Box::new(transformer(
                &["alice@example.com"],
                &dir,
                Arc::new(FailingSigner),
            )),
            Box::new(transformer(
                &["alice@example.com"],
                &dir,
                Arc::new(PrefixSigner::default()),
            )),
        ];
        let mut message = OutgoingMessage::from_raw("alice@example.com", "bob@example.org", RAW);

        let result =
            <SmimeSignTransformer as MessageTransformer>::apply(&transformers, &mut message).await;

        assert!(result.is_err());
        assert!(!message.is_signed());
    }

    #[tokio::test]
    async fn test_sign_message_is_idempotent() {
        let dir = cert_dir(&["alice@example.com"]);
        let transformer = transformer(
            &["alice@example.com"],
            &dir,
            Arc::new(PrefixSigner::default()),
        );
        let message = OutgoingMessage::from_raw("alice@example.com", "bob@example.org", RAW);

        let first = transformer.sign_message(&message).await.unwrap();
        let second = transformer.sign_message(&message).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_from_config() {
        let dir = cert_dir(&[]);
        let config = SmimeConfig {
            allowed_emails: vec!["alice@example.com".to_string()],
            cert_dir: dir.path().to_string_lossy().into_owned(),
            ..SmimeConfig::default()
        };
        let transformer = SmimeSignTransformer::from_config(&config, CancellationToken::new());
        let message = OutgoingMessage::from_raw("alice@example.com", "bob@example.org", RAW);

        let outcome = transformer.sign_message(&message).await.unwrap();

        assert!(matches!(
            outcome,
            SigningOutcome::Skipped(SkipReason::CredentialNotFound { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_from_config_shares_shutdown() {
        let dir = cert_dir(&["alice@example.com"]);
        let mut config = SmimeConfig {
            allowed_emails: vec!["alice@example.com".to_string()],
            cert_dir: dir.path().to_string_lossy().into_owned(),
            ..SmimeConfig::default()
        };
        config.signer.command = ["sh", "-c", "exec sleep 5", "openssl"]
            .map(String::from)
            .to_vec();
        let shutdown = CancellationToken::new();
        let transformer = SmimeSignTransformer::from_config(&config, shutdown.clone());
        let mut message = OutgoingMessage::from_raw("alice@example.com", "bob@example.org", RAW);
        shutdown.cancel();

        let result = transformer.transform(&mut message).await;

        assert!(matches!(
            result,
            Err(TransformError::Signing(SignError::Cancelled))
        ));
        assert!(!message.is_signed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_credential_lookup_error_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let not_a_dir = temp_dir.path().join("certs");
        std::fs::write(&not_a_dir, b"not a directory").unwrap();
        let signer = Arc::new(PrefixSigner::default());
        let transformer = SmimeSignTransformer::new(
            SigningPolicy::new(["alice@example.com"]),
            CredentialStore::new(&not_a_dir, "p12"),
            signer.clone(),
        );
        let mut message = OutgoingMessage::from_raw("alice@example.com", "bob@example.org", RAW);

        let result = transformer.transform(&mut message).await;

        assert!(matches!(result, Err(TransformError::Credential(_))));
        assert!(!message.is_signed());
        assert_eq!(message.raw(), RAW);
        assert_eq!(signer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_transformer_name() {
        let dir = cert_dir(&[]);
        let transformer = transformer(&[], &dir, Arc::new(FailingSigner));
        assert_eq!(transformer.name(), "smime_sign");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_messages_with_openssl_signer() {
        let dir = cert_dir(&["alice@example.com", "bob@example.com"]);
        let signer = OpensslSigner::with_launcher([
            "sh",
            "-c",
            "printf '%s\\n' \"$4\"; cat",
            "openssl",
        ]);
        let transformer = transformer(
            &["alice@example.com", "bob@example.com"],
            &dir,
            Arc::new(signer),
        );
        let alice = OutgoingMessage::from_raw(
            "alice@example.com",
            "x@example.org",
            b"From: alice@example.com\r\n\r\nfrom alice",
        );
        let bob = OutgoingMessage::from_raw(
            "bob@example.com",
            "x@example.org",
            b"From: Bob <bob@example.com>\r\n\r\nfrom bob",
        );

        let (first, second) = tokio::join!(
            transformer.sign_message(&alice),
            transformer.sign_message(&bob)
        );

        let bundle = |name: &str| -> PathBuf { dir.path().join(name) };
        let expected = |name: &str, raw: &[u8]| {
            let mut signed = format!("{}\n", bundle(name).display()).into_bytes();
            signed.extend_from_slice(raw);
            SigningOutcome::Signed(signed)
        };
        assert_eq!(
            first.unwrap(),
            expected("alice_example_com.p12", alice.raw())
        );
        assert_eq!(second.unwrap(), expected("bob_example_com.p12", bob.raw()));
    }
}
