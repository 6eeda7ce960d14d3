//! Payload type for the shoot cluster CA store.

/// A shoot cluster CA bundle, wrapped as a JSON document.
///
/// The buffer holds `{"certs":"<concatenated PEM>"}` as produced by the
/// CA reconciler, so every artifact the server returns is JSON.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Data {
    /// The serialized CA bundle document.
    pub ca_bundle: Vec<u8>,
}
