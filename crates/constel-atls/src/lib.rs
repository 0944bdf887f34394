// constel-atls: Attested TLS and measurement watching
// Depends on constel-core.
//
// A TLS handshake is "attested" when the peer's self-signed certificate
// embeds an attestation document binding the certificate's public key to a
// nonce chosen by the other side. Issuers produce such documents, validators
// check them.

pub mod attestation;
pub mod measured;
pub mod tls;
pub mod watcher;

pub use attestation::{Issuer, Validator};
pub use tls::{
    AttestationClientConfig, AttestationServerConfig, create_attestation_client_config,
    create_attestation_server_config,
};
