//! Cleaning passes between download and storage.
//!
//! Every pass keeps the first occurrence, preserves relative order, leaves its input untouched
//! and logs the size before and after.

use std::collections::HashMap;
use std::io::Cursor;

use blake3::Hasher as Blake3Hasher;
use image::ImageReader;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::scraper::Payload;

/// How duplicate payloads are detected.
///
/// Every strategy yields the same output; the digest strategies only avoid the quadratic scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DedupStrategy {
    /// Compare each payload against every payload already kept.
    Exact,
    /// Bucket by BLAKE3 digest, then confirm byte equality inside a bucket.
    Blake3,
    /// Bucket by SHA-256 digest, then confirm byte equality inside a bucket.
    Sha256,
}

/// Drops every absent slot.
pub fn remove_absent(slots: Vec<Option<Payload>>) -> Vec<Payload> {
    info!("Size before removing empty images: {}", slots.len());
    let cleaned: Vec<Payload> = slots.into_iter().flatten().collect();
    info!("Size after removing empty images: {}", cleaned.len());
    cleaned
}

/// Keeps a payload only if no identical payload was kept before it.
pub fn deduplicate(payloads: &[Payload], strategy: DedupStrategy) -> Vec<Payload> {
    info!("Size before de-duplication: {}", payloads.len());
    let uniques = match strategy {
        DedupStrategy::Exact => deduplicate_exact(payloads),
        DedupStrategy::Blake3 => deduplicate_by_digest(payloads, blake3_digest),
        DedupStrategy::Sha256 => deduplicate_by_digest(payloads, sha256_digest),
    };
    info!("Size after de-duplication: {}", uniques.len());
    uniques
}

fn deduplicate_exact(payloads: &[Payload]) -> Vec<Payload> {
    let mut uniques: Vec<Payload> = Vec::new();
    for payload in payloads {
        if !uniques.iter().any(|unique| unique == payload) {
            uniques.push(payload.clone());
        }
    }
    uniques
}

fn deduplicate_by_digest(payloads: &[Payload], digest: fn(&[u8]) -> Vec<u8>) -> Vec<Payload> {
    // Digests are computed up front in parallel; the scan itself stays in order.
    let digests: Vec<Vec<u8>> = payloads.par_iter().map(|p| digest(p.as_bytes())).collect();

    let mut buckets: HashMap<&[u8], Vec<usize>> = HashMap::new();
    let mut uniques: Vec<Payload> = Vec::new();

    for (payload, key) in payloads.iter().zip(digests.iter()) {
        let bucket = buckets.entry(key.as_slice()).or_default();
        if bucket.iter().any(|&kept| uniques[kept] == *payload) {
            debug!(digest = %hex::encode(key), "Dropping duplicate payload");
            continue;
        }
        bucket.push(uniques.len());
        uniques.push(payload.clone());
    }
    uniques
}

fn blake3_digest(bytes: &[u8]) -> Vec<u8> {
    let mut hasher = Blake3Hasher::new();
    hasher.update(bytes);
    hasher.finalize().as_bytes().to_vec()
}

fn sha256_digest(bytes: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().to_vec()
}

/// Whether the bytes decode as an image of any supported format.
pub fn is_decodable(bytes: &[u8]) -> bool {
    match ImageReader::new(Cursor::new(bytes)).with_guessed_format() {
        Ok(reader) => reader.format().is_some() && reader.decode().is_ok(),
        Err(_) => false,
    }
}

/// Drops payloads that fail to decode as an image.
pub fn remove_corrupt(payloads: &[Payload]) -> Vec<Payload> {
    info!("Size before removing corrupt images: {}", payloads.len());
    let keep: Vec<bool> = payloads.par_iter().map(|p| is_decodable(p)).collect();
    let cleaned: Vec<Payload> = payloads
        .iter()
        .zip(keep)
        .filter_map(|(payload, ok)| ok.then(|| payload.clone()))
        .collect();
    info!("Size after removing corrupt images: {}", cleaned.len());
    cleaned
}
