//! Storage providers and location kinds.
//!
//! A [`FileProvider`] identifies the backend actually hosting a file (local
//! disk, a cloud drive, a network volume). Providers matter to this crate for
//! two reasons: a timeout should name the provider that failed to respond,
//! and files served by non-local providers are never memory-mapped.
//!
//! A [`LocationKind`] records how a file became known to the application
//! (app-owned storage vs. picked by the user from somewhere else).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Storage backend hosting a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FileProvider {
    /// Files on the device's own storage.
    LocalStorage,
    /// Apple iCloud Drive.
    ICloudDrive,
    /// Dropbox.
    Dropbox,
    /// Google Drive.
    GoogleDrive,
    /// Microsoft OneDrive.
    OneDrive,
    /// Box.
    Box,
    /// Nextcloud / ownCloud.
    Nextcloud,
    /// SMB/NFS or other mounted network volume.
    NetworkVolume,
    /// Any other provider, by identifier.
    Other(String),
}

/// Path markers used to infer the provider of a file.
///
/// Checked in order; the first marker contained in the path wins.
const PATH_MARKERS: &[(&str, FileProvider)] = &[
    ("/Mobile Documents/", FileProvider::ICloudDrive),
    ("/iCloud Drive/", FileProvider::ICloudDrive),
    ("/CloudStorage/Dropbox", FileProvider::Dropbox),
    ("/Dropbox/", FileProvider::Dropbox),
    ("/CloudStorage/GoogleDrive", FileProvider::GoogleDrive),
    ("/Google Drive/", FileProvider::GoogleDrive),
    ("/CloudStorage/OneDrive", FileProvider::OneDrive),
    ("/OneDrive/", FileProvider::OneDrive),
    ("/CloudStorage/Box", FileProvider::Box),
    ("/Box/", FileProvider::Box),
    ("/Nextcloud/", FileProvider::Nextcloud),
    ("/ownCloud/", FileProvider::Nextcloud),
    ("/Volumes/", FileProvider::NetworkVolume),
    ("/mnt/", FileProvider::NetworkVolume),
    ("/media/", FileProvider::NetworkVolume),
];

impl FileProvider {
    /// Stable reverse-DNS identifier of this provider.
    pub fn id(&self) -> &str {
        match self {
            FileProvider::LocalStorage => "com.apple.FileProvider.LocalStorage",
            FileProvider::ICloudDrive => "com.apple.CloudDocs.MobileDocumentsFileProvider",
            FileProvider::Dropbox => "com.getdropbox.Dropbox.FileProvider",
            FileProvider::GoogleDrive => "com.google.drivefs.fpext",
            FileProvider::OneDrive => "com.microsoft.skydrive.onedrivefileprovider",
            FileProvider::Box => "net.box.BoxNet.documentPickerFileProvider",
            FileProvider::Nextcloud => "com.nextcloud.File-Provider-Extension",
            FileProvider::NetworkVolume => "com.apple.filesystems.network",
            FileProvider::Other(id) => id,
        }
    }

    /// Human-readable provider name.
    pub fn display_name(&self) -> &str {
        match self {
            FileProvider::LocalStorage => "Local storage",
            FileProvider::ICloudDrive => "iCloud Drive",
            FileProvider::Dropbox => "Dropbox",
            FileProvider::GoogleDrive => "Google Drive",
            FileProvider::OneDrive => "OneDrive",
            FileProvider::Box => "Box",
            FileProvider::Nextcloud => "Nextcloud",
            FileProvider::NetworkVolume => "Network volume",
            FileProvider::Other(id) => id,
        }
    }

    /// Returns true if the provider is the device's own storage.
    pub fn is_local(&self) -> bool {
        matches!(self, FileProvider::LocalStorage)
    }

    /// Looks up a provider by its identifier.
    ///
    /// Unknown identifiers map to [`FileProvider::Other`].
    pub fn from_id(id: &str) -> Self {
        const KNOWN: [FileProvider; 8] = [
            FileProvider::LocalStorage,
            FileProvider::ICloudDrive,
            FileProvider::Dropbox,
            FileProvider::GoogleDrive,
            FileProvider::OneDrive,
            FileProvider::Box,
            FileProvider::Nextcloud,
            FileProvider::NetworkVolume,
        ];
        KNOWN
            .into_iter()
            .find(|provider| provider.id() == id)
            .unwrap_or_else(|| FileProvider::Other(id.to_string()))
    }

    /// Infers the provider hosting `path` from well-known path markers.
    pub fn detect(path: &Path) -> Self {
        let path = path.to_string_lossy();
        PATH_MARKERS
            .iter()
            .find(|(marker, _)| path.contains(marker))
            .map_or(FileProvider::LocalStorage, |(_, provider)| provider.clone())
    }
}

impl fmt::Display for FileProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl From<String> for FileProvider {
    fn from(id: String) -> Self {
        FileProvider::from_id(&id)
    }
}

impl From<FileProvider> for String {
    fn from(provider: FileProvider) -> Self {
        provider.id().to_string()
    }
}

/// How a file became known to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LocationKind {
    /// The application's own documents storage.
    InternalDocuments,
    /// The application's backup storage.
    InternalBackup,
    /// Files handed to the application by other apps.
    InternalInbox,
    /// A file picked by the user from outside the application.
    External,
    /// A file reached through a network or cloud provider.
    Remote,
}

impl LocationKind {
    /// Returns true for app-owned locations.
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            LocationKind::InternalDocuments | LocationKind::InternalBackup | LocationKind::InternalInbox
        )
    }

    /// Short lowercase name used in CLI output and parsing.
    pub fn as_str(self) -> &'static str {
        match self {
            LocationKind::InternalDocuments => "local",
            LocationKind::InternalBackup => "internal-backup",
            LocationKind::InternalInbox => "internal-inbox",
            LocationKind::External => "external",
            LocationKind::Remote => "remote",
        }
    }
}

impl fmt::Display for LocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown location kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown location kind: {0}")]
pub struct UnknownLocationKind(pub String);

impl FromStr for LocationKind {
    type Err = UnknownLocationKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" | "internal-documents" => Ok(LocationKind::InternalDocuments),
            "internal-backup" | "backup" => Ok(LocationKind::InternalBackup),
            "internal-inbox" | "inbox" => Ok(LocationKind::InternalInbox),
            "external" => Ok(LocationKind::External),
            "remote" | "network" => Ok(LocationKind::Remote),
            _ => Err(UnknownLocationKind(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_detect_local() {
        assert_eq!(
            FileProvider::detect(&PathBuf::from("/tmp/db.kdbx")),
            FileProvider::LocalStorage
        );
    }

    #[test]
    fn test_detect_cloud_providers() {
        let icloud = PathBuf::from(
            "/Users/me/Library/Mobile Documents/com~apple~CloudDocs/db.kdbx",
        );
        assert_eq!(FileProvider::detect(&icloud), FileProvider::ICloudDrive);

        let dropbox = PathBuf::from("/Users/me/Library/CloudStorage/Dropbox-Personal/db.kdbx");
        assert_eq!(FileProvider::detect(&dropbox), FileProvider::Dropbox);

        let volume = PathBuf::from("/Volumes/nas/db.kdbx");
        assert_eq!(FileProvider::detect(&volume), FileProvider::NetworkVolume);
    }

    #[test]
    fn test_id_round_trip() {
        assert_eq!(
            FileProvider::from_id(FileProvider::Dropbox.id()),
            FileProvider::Dropbox
        );
        assert_eq!(
            FileProvider::from_id("org.example.provider"),
            FileProvider::Other("org.example.provider".to_string())
        );
    }

    #[test]
    fn test_provider_serializes_as_id() {
        let json = serde_json::to_string(&FileProvider::OneDrive).unwrap();
        assert_eq!(json, "\"com.microsoft.skydrive.onedrivefileprovider\"");
        let back: FileProvider = serde_json::from_str(&json).unwrap();
        assert_eq!(back, FileProvider::OneDrive);
    }

    #[test]
    fn test_location_parse() {
        assert_eq!("local".parse::<LocationKind>().unwrap(), LocationKind::InternalDocuments);
        assert_eq!("Remote".parse::<LocationKind>().unwrap(), LocationKind::Remote);
        assert!("somewhere".parse::<LocationKind>().is_err());
        assert!(LocationKind::InternalBackup.is_internal());
        assert!(!LocationKind::External.is_internal());
        assert_eq!(LocationKind::InternalDocuments.to_string(), "local");
    }
}
