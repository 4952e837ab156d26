//! Mobile image mounter
//!
//! Uploads and mounts disk images. Personalized images additionally need
//! signed manifest material, which is supplied by a `ManifestOracle` so the
//! ticket source stays out of the transport core.

use sha2::{Digest, Sha384};
use tracing::debug;

use crate::provider::ManifestOracle;
use crate::services::DeviceService;
use crate::{RemoteXpcError, ServiceConnection};

/// Client for the mobile image mounter service
#[derive(Debug)]
pub struct ImageMounterClient {
    pub connection: ServiceConnection,
}

impl DeviceService for ImageMounterClient {
    fn service_name() -> std::borrow::Cow<'static, str> {
        "com.apple.mobile.mobile_image_mounter.shim.remote".into()
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, RemoteXpcError> {
        Ok(Self::new(connection))
    }
}

impl ImageMounterClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self { connection }
    }

    /// Lists currently mounted images
    pub async fn copy_devices(&mut self) -> Result<Vec<plist::Value>, RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "CopyDevices".into());
        let mut res = self.connection.plist_request(req.into(), None).await?;

        match res.remove("EntryList") {
            Some(plist::Value::Array(i)) => Ok(i),
            _ => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    /// Looks an image up by type and returns its signatures
    pub async fn lookup_image(
        &mut self,
        image_type: &str,
    ) -> Result<Vec<Vec<u8>>, RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "LookupImage".into());
        req.insert("ImageType".into(), image_type.into());
        let mut res = self.connection.plist_request(req.into(), None).await?;

        match res.remove("ImageSignature") {
            Some(plist::Value::Array(sigs)) => Ok(sigs
                .into_iter()
                .filter_map(|x| x.into_data())
                .collect()),
            _ => Err(RemoteXpcError::ImageNotMounted),
        }
    }

    /// Uploads an image to the device
    pub async fn upload_image(
        &mut self,
        image_type: &str,
        image: &[u8],
        signature: &[u8],
    ) -> Result<(), RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "ReceiveBytes".into());
        req.insert("ImageType".into(), image_type.into());
        req.insert("ImageSize".into(), (image.len() as u64).into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature.to_vec()));
        let res = self.connection.plist_request(req.into(), None).await?;

        if res.get("Status").and_then(|x| x.as_string()) != Some("ReceiveBytesAck") {
            return Err(RemoteXpcError::UnexpectedResponse);
        }

        debug!("Uploading {} image bytes", image.len());
        self.connection.send_raw(image).await?;

        let res = self.connection.read_plist().await?;
        if res.get("Status").and_then(|x| x.as_string()) != Some("Complete") {
            return Err(RemoteXpcError::UnexpectedResponse);
        }
        Ok(())
    }

    /// Mounts a previously uploaded image
    pub async fn mount_image(
        &mut self,
        image_type: &str,
        signature: &[u8],
        trust_cache: Option<Vec<u8>>,
        info_plist: Option<plist::Value>,
    ) -> Result<(), RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "MountImage".into());
        req.insert("ImageType".into(), image_type.into());
        req.insert("ImagePath".into(), "/private/var/mobile/Media/PublicStaging/staging.dimage".into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature.to_vec()));
        if let Some(tc) = trust_cache {
            req.insert("ImageTrustCache".into(), plist::Value::Data(tc));
        }
        if let Some(info) = info_plist {
            req.insert("ImageInfoPlist".into(), info);
        }
        let res = self.connection.plist_request(req.into(), None).await?;

        match res.get("Status").and_then(|x| x.as_string()) {
            Some("Complete") => Ok(()),
            _ => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    /// Unmounts an image by mount path
    pub async fn unmount_image(&mut self, mount_path: &str) -> Result<(), RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "UnmountImage".into());
        req.insert("MountPath".into(), mount_path.into());
        let res = self.connection.plist_request(req.into(), None).await?;

        match res.get("Status").and_then(|x| x.as_string()) {
            Some("Complete") => Ok(()),
            _ => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    /// Queries the identifiers personalization needs
    pub async fn query_personalization_identifiers(
        &mut self,
    ) -> Result<plist::Dictionary, RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "QueryPersonalizationIdentifiers".into());
        let mut res = self.connection.plist_request(req.into(), None).await?;

        match res
            .remove("PersonalizationIdentifiers")
            .and_then(|x| x.into_dictionary())
        {
            Some(ids) => Ok(ids),
            None => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    /// Uploads and mounts a personalized image
    ///
    /// The oracle supplies the signed manifest for this device's chip and
    /// board identifiers.
    pub async fn mount_personalized<O: ManifestOracle>(
        &mut self,
        image: &[u8],
        trust_cache: Vec<u8>,
        oracle: &mut O,
    ) -> Result<(), RemoteXpcError> {
        let identifiers = self.query_personalization_identifiers().await?;
        let board_id = identifiers
            .get("BoardId")
            .and_then(|x| x.as_unsigned_integer())
            .ok_or(RemoteXpcError::UnexpectedResponse)?;
        let chip_id = identifiers
            .get("ChipID")
            .and_then(|x| x.as_unsigned_integer())
            .ok_or(RemoteXpcError::UnexpectedResponse)?;
        let unique_chip_id = identifiers
            .get("UniqueChipID")
            .and_then(|x| x.as_unsigned_integer())
            .ok_or(RemoteXpcError::UnexpectedResponse)?;

        let manifest = oracle.manifest(board_id, chip_id, unique_chip_id).await?;

        let signature = image_signature(image);
        self.upload_image("Personalized", image, &signature).await?;

        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "MountImage".into());
        req.insert("ImageType".into(), "Personalized".into());
        req.insert("ImageSignature".into(), plist::Value::Data(signature));
        req.insert("ImageTrustCache".into(), plist::Value::Data(trust_cache));
        req.insert("ImageInfoPlist".into(), plist::Value::Data(manifest));
        let res = self.connection.plist_request(req.into(), None).await?;

        match res.get("Status").and_then(|x| x.as_string()) {
            Some("Complete") => Ok(()),
            _ => Err(RemoteXpcError::UnexpectedResponse),
        }
    }

    /// Queries whether developer mode is enabled
    pub async fn query_developer_mode_status(&mut self) -> Result<bool, RemoteXpcError> {
        let mut req = plist::Dictionary::new();
        req.insert("Command".into(), "QueryDeveloperModeStatus".into());
        let res = self.connection.plist_request(req.into(), None).await?;

        match res.get("DeveloperModeStatus").and_then(|x| x.as_boolean()) {
            Some(status) => Ok(status),
            None => Err(RemoteXpcError::UnexpectedResponse),
        }
    }
}

/// The SHA-384 digest the mounter uses to identify an uploaded image
pub fn image_signature(image: &[u8]) -> Vec<u8> {
    Sha384::digest(image).to_vec()
}
