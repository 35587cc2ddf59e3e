#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use rand::{Rng, SeedableRng};
use std::path::Path;
use std::sync::Arc;
use tranche_core::encoding::{decode, EncodingOptions};
use tranche_core::hash::ContentHash;
use tranche_core::model::MetadataRecord;
use tranche_core::net::memory::MemoryNetwork;
use tranche_core::{Credentials, UploadConfig, UploadSession};

pub fn write_random_file(path: &Path, size: usize, seed: u64) {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; size];
    rng.fill(&mut buf[..]);
    std::fs::write(path, &buf).unwrap();
}

pub fn credentials(seed: u8) -> Credentials {
    Credentials::new("tester", SigningKey::from_bytes(&[seed; 32]))
}

/// Fast-polling config for `source`, signed by the default test key.
pub fn config(source: &Path) -> UploadConfig {
    UploadConfig {
        source: source.to_path_buf(),
        poll_interval_ms: 2,
        credentials: Some(credentials(7)),
        ..Default::default()
    }
}

pub fn session(net: &MemoryNetwork, cfg: UploadConfig) -> UploadSession {
    UploadSession::new(cfg, Arc::new(net.clone()), Arc::new(net.clone()))
}

pub fn meta_record(net: &MemoryNetwork, hash: &ContentHash) -> Option<MetadataRecord> {
    net.hosts()
        .into_iter()
        .filter_map(|h| net.server(&h)?.meta_chunk(hash))
        .map(|b| MetadataRecord::from_bytes(&b).unwrap())
        .next()
}

pub fn data_chunk(net: &MemoryNetwork, hash: &ContentHash) -> Option<Vec<u8>> {
    net.hosts().into_iter().filter_map(|h| net.server(&h)?.data_chunk(hash)).next()
}

/// Reassemble and decode the file behind `hash` from whatever the network holds.
/// Returns the pre-transform stream, padding included.
pub fn download(net: &MemoryNetwork, hash: &ContentHash, passphrase: Option<&str>) -> Vec<u8> {
    let record = meta_record(net, hash).expect("metadata on the network");
    let entry = &record.uploaders[0];
    let mut encoded = Vec::new();
    for part in &entry.parts {
        encoded.extend_from_slice(&data_chunk(net, part).expect("chunk on the network"));
    }
    let opts = EncodingOptions {
        passphrase,
        compress: false,
        dataset_path: &entry.properties.dataset_path,
    };
    decode(&entry.encodings, &opts, &encoded).unwrap()
}
