use anyhow::Result;

/// Object identifier as a list of arcs, e.g. `[1, 3, 9900, 3, 1]`.
pub type Oid = &'static [u64];

/// Dotted-decimal rendering of an OID.
pub fn oid_string(oid: Oid) -> String {
    oid.iter()
        .map(|arc| arc.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Produces attestation documents binding `user_data` to `nonce`.
pub trait Issuer: Send + Sync {
    /// Extension OID under which documents of this issuer are embedded.
    fn oid(&self) -> Oid;

    fn issue(&self, user_data: &[u8], nonce: &[u8]) -> Result<Vec<u8>>;
}

/// Checks attestation documents of one variant.
pub trait Validator: Send + Sync {
    fn oid(&self) -> Oid;

    /// Validate `doc` against `nonce`, returning the user data it binds.
    fn validate(&self, doc: &[u8], nonce: &[u8]) -> Result<Vec<u8>>;
}
