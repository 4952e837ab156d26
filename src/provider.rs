// Jackson Coxson

use std::future::Future;

use crate::RemoteXpcError;

/// Capability for asking the user for the PIN the device displays
///
/// The pairing engine applies the prompt ceiling and digit validation;
/// implementations just produce whatever the user typed. Any `FnMut`
/// closure returning a future works.
pub trait PinPrompter: Send {
    fn prompt(&mut self) -> impl Future<Output = String> + Send;
}

impl<F, Fut> PinPrompter for F
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = String> + Send,
{
    fn prompt(&mut self) -> impl Future<Output = String> + Send {
        (self)()
    }
}

/// Capability for producing signed manifest material for personalized
/// image mounts
///
/// The mounter asks the oracle for a manifest matching the device's board
/// and chip identifiers; how the ticket is obtained (TSS, cache, file) is
/// the implementation's business.
pub trait ManifestOracle: Send {
    fn manifest(
        &mut self,
        board_id: u64,
        chip_id: u64,
        unique_chip_id: u64,
    ) -> impl Future<Output = Result<Vec<u8>, RemoteXpcError>> + Send;
}

/// Oracle backed by a manifest already on hand
#[derive(Debug, Clone)]
pub struct StaticManifest(pub Vec<u8>);

impl ManifestOracle for StaticManifest {
    async fn manifest(
        &mut self,
        _board_id: u64,
        _chip_id: u64,
        _unique_chip_id: u64,
    ) -> Result<Vec<u8>, RemoteXpcError> {
        if self.0.is_empty() {
            return Err(RemoteXpcError::MissingManifest);
        }
        Ok(self.0.clone())
    }
}
