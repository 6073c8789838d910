#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Field-level anonymization of person records.
//!
//! The transform is pure and total: identifying fields are replaced by
//! fixed-length tokens, everything else is copied verbatim. Idempotent
//! delivery does not depend on the generator being deterministic; the
//! upsert key carries that. The deterministic generator exists because it
//! makes the output reproducible and the tests simple.

use rand::Rng;
use sha2::{Digest, Sha256};

use veil_core::types::SourceRecord;

/// Length of every replacement token.
pub const TOKEN_LEN: usize = 8;

const ALPHABET: &[u8; 62] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Pseudo-anonymous value generator: string in, 8-char alphanumeric out.
///
/// Implementations share no state and must be pure per call (the random
/// generator draws fresh entropy, which still counts: it never reads the
/// input and never fails).
pub trait Generator: Send + Sync + 'static {
    fn token(&self, original: &str) -> String;
}

/// Keyed SHA-256 of the original value, encoded into the token alphabet.
///
/// Same key + same input always yields the same token, so re-anonymizing a
/// replayed record writes an identical document.
#[derive(Debug, Clone)]
pub struct DeterministicGenerator {
    key: Vec<u8>,
}

impl DeterministicGenerator {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }
}

impl Generator for DeterministicGenerator {
    fn token(&self, original: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update([0u8]);
        hasher.update(original.as_bytes());
        let digest = hasher.finalize();

        digest
            .iter()
            .take(TOKEN_LEN)
            .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
            .collect()
    }
}

/// Fresh random token per call.
#[derive(Debug, Clone, Default)]
pub struct RandomGenerator;

impl Generator for RandomGenerator {
    fn token(&self, _original: &str) -> String {
        let mut rng = rand::thread_rng();
        (0..TOKEN_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect()
    }
}

/// Generator strategy selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    Deterministic,
    Random,
}

impl GeneratorKind {
    pub fn build(self, key: &str) -> Box<dyn Generator> {
        match self {
            GeneratorKind::Deterministic => Box::new(DeterministicGenerator::new(key.as_bytes())),
            GeneratorKind::Random => Box::new(RandomGenerator),
        }
    }
}

impl std::str::FromStr for GeneratorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deterministic" => Ok(GeneratorKind::Deterministic),
            "random" => Ok(GeneratorKind::Random),
            other => Err(format!(
                "unknown generator kind {other:?} (expected deterministic|random)"
            )),
        }
    }
}

/// Maps a source record to its anonymized projection.
///
/// Replaced: given name, family name, address line1/line2/postcode, email
/// local part. Preserved: id, created_at, city, region, country, email
/// domain. An email without `@` is treated as all local part.
pub fn anonymize(generator: &dyn Generator, record: &SourceRecord) -> SourceRecord {
    let mut out = record.clone();
    out.given_name = generator.token(&record.given_name);
    out.family_name = generator.token(&record.family_name);
    out.address.line1 = generator.token(&record.address.line1);
    out.address.line2 = generator.token(&record.address.line2);
    out.address.postcode = generator.token(&record.address.postcode);
    out.email = anonymize_email(generator, &record.email);
    out
}

fn anonymize_email(generator: &dyn Generator, email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => format!("{}@{domain}", generator.token(local)),
        None => generator.token(email),
    }
}
