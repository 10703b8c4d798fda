// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Package archives and the manifest of their expected digests.
//!
//! The manifest is a TOML document mapping archive file name to hex SHA-256:
//!
//! ```toml
//! [packages]
//! "mysql-8.0.36-linux-x86_64.tar.gz" = "9f86d081884c7d65..."
//! ```

use camino::Utf8Path;
use camino::Utf8PathBuf;
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use std::collections::BTreeMap;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PackageManifest {
    #[serde(default)]
    pub packages: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("failed to read {path}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },

    #[error("failed to parse package manifest {path}")]
    Manifest {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },

    #[error("package {name} is not listed in the manifest")]
    NotInManifest { name: String },

    #[error("digest mismatch for {name}: manifest says {expected}, file is {actual}")]
    DigestMismatch { name: String, expected: String, actual: String },

    #[error("failed to unpack {archive} into {dest}")]
    Unpack {
        archive: Utf8PathBuf,
        dest: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl PackageManifest {
    pub async fn load(path: &Utf8Path) -> Result<Self, PackageError> {
        let contents = fs_err::tokio::read_to_string(path)
            .await
            .map_err(|err| PackageError::Io { path: path.to_owned(), err })?;
        toml::from_str(&contents).map_err(|err| PackageError::Manifest {
            path: path.to_owned(),
            err,
        })
    }

    pub fn expected_digest(&self, name: &str) -> Result<&str, PackageError> {
        self.packages
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| PackageError::NotInManifest { name: name.to_string() })
    }

    /// Checks that the archive at `path` matches the manifest entry for its
    /// file name.
    pub async fn verify(&self, path: &Utf8Path) -> Result<(), PackageError> {
        let name = path.file_name().unwrap_or(path.as_str());
        let expected = self.expected_digest(name)?;
        let actual = sha256_file(path).await?;
        if !expected.eq_ignore_ascii_case(&actual) {
            return Err(PackageError::DigestMismatch {
                name: name.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

/// Calculates the hex SHA-256 digest of a file.
pub async fn sha256_file(path: &Utf8Path) -> Result<String, PackageError> {
    let io_err = |err| PackageError::Io { path: path.to_owned(), err };
    let mut reader =
        BufReader::new(fs_err::tokio::File::open(path).await.map_err(io_err)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0; 8192];
    loop {
        let count = reader.read(&mut buffer).await.map_err(io_err)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Unpacks a gzipped tarball into `dest`, creating it if needed.
pub fn unpack(archive: &Utf8Path, dest: &Utf8Path) -> Result<(), PackageError> {
    let unpack_err = |err| PackageError::Unpack {
        archive: archive.to_owned(),
        dest: dest.to_owned(),
        err,
    };
    fs_err::create_dir_all(dest).map_err(unpack_err)?;
    let file = fs_err::File::open(archive).map_err(unpack_err)?;
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.set_preserve_permissions(true);
    tar.unpack(dest).map_err(unpack_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn build_archive(dir: &Utf8Path) -> Utf8PathBuf {
        let path = dir.join("redis-7.2.4-linux-x86_64.tar.gz");
        let file = fs_err::File::create(&path).unwrap();
        let mut builder =
            tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let contents = b"#!/bin/sh\necho redis\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, "bin/redis-server", &contents[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[tokio::test]
    async fn verify_and_unpack() {
        let dir = Utf8TempDir::new().unwrap();
        let archive = build_archive(dir.path());
        let digest = sha256_file(&archive).await.unwrap();
        assert_eq!(digest.len(), 64);

        let manifest_path = dir.path().join("manifest.toml");
        fs_err::write(
            &manifest_path,
            format!(
                "[packages]\n\"redis-7.2.4-linux-x86_64.tar.gz\" = \"{}\"\n",
                digest.to_uppercase()
            ),
        )
        .unwrap();
        let manifest = PackageManifest::load(&manifest_path).await.unwrap();
        manifest.verify(&archive).await.unwrap();

        let dest = dir.path().join("redis-6379");
        unpack(&archive, &dest).unwrap();
        assert!(dest.join("bin/redis-server").is_file());
    }

    #[tokio::test]
    async fn verify_rejects_unknown_and_tampered_packages() {
        let dir = Utf8TempDir::new().unwrap();
        let archive = build_archive(dir.path());

        let empty = PackageManifest::default();
        assert!(matches!(
            empty.verify(&archive).await,
            Err(PackageError::NotInManifest { .. })
        ));

        let mut wrong = PackageManifest::default();
        wrong.packages.insert(
            "redis-7.2.4-linux-x86_64.tar.gz".to_string(),
            "00".repeat(32),
        );
        assert!(matches!(
            wrong.verify(&archive).await,
            Err(PackageError::DigestMismatch { .. })
        ));
    }
}
