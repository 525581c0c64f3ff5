//! Stream-stage descriptors and pipeline assembly.
//!
//! A descriptor is everything needed to rebuild one stage at read time.
//! Inside an entry token they are flattened under `stage.<i>.`:
//!
//! ```text
//! stage.0.kind=s:mac,stage.0.def=x:0202,stage.0.value=x:…,stage.0.count=i:5,
//! stage.1.kind=s:compress,stage.1.def=x:<codec uuid>,
//! stage.2.kind=s:cipher,stage.2.def=x:020100000100,stage.2.iv=x:…
//! ```
//! Index 0 is the outermost stage.

use std::fmt;

use crate::codec::CodecId;
use crate::crypto::{Algorithm, CryptoProvider, Keyset};
use crate::error::{Error, Result};
use crate::options::{ArchiveOptions, Integrity};
use crate::props::PropertyBag;
use crate::stream::{
    CompressReader, CompressWriter, DecryptingReader, DigestReader, DigestWriter, EncryptingWriter,
    StageRead, StageWrite,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Digest,
    Mac,
    Cipher,
    Compress,
}

impl StageKind {
    pub fn tag(self) -> &'static str {
        match self {
            StageKind::Digest   => "digest",
            StageKind::Mac      => "mac",
            StageKind::Cipher   => "cipher",
            StageKind::Compress => "compress",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "digest"   => Ok(StageKind::Digest),
            "mac"      => Ok(StageKind::Mac),
            "cipher"   => Ok(StageKind::Cipher),
            "compress" => Ok(StageKind::Compress),
            other      => Err(Error::format(format!("unknown stage kind '{other}'"))),
        }
    }

    /// Digest and MAC stages carry a value and a byte count.
    pub fn is_verifying(self) -> bool {
        matches!(self, StageKind::Digest | StageKind::Mac)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDescriptor {
    pub kind:  StageKind,
    /// Algorithm + key selector for crypto stages, codec UUID for compression.
    pub def:   Vec<u8>,
    pub iv:    Vec<u8>,
    /// Final digest/MAC output; empty for other kinds.
    pub value: Vec<u8>,
    pub count: Option<u64>,
}

impl StageDescriptor {
    pub fn write_properties(&self, bag: &mut PropertyBag, prefix: &str) {
        bag.insert(format!("{prefix}kind"), self.kind.tag());
        bag.insert(format!("{prefix}def"), self.def.clone());
        if !self.iv.is_empty() {
            bag.insert(format!("{prefix}iv"), self.iv.clone());
        }
        if !self.value.is_empty() {
            bag.insert(format!("{prefix}value"), self.value.clone());
        }
        if let Some(count) = self.count {
            // i64 covers any stream length a file system will hold
            bag.insert(format!("{prefix}count"), count as i64);
        }
    }

    pub fn read_properties(bag: &PropertyBag, prefix: &str) -> Result<Self> {
        let kind = StageKind::from_tag(bag.str(&format!("{prefix}kind"))?)?;
        let def  = bag.bytes(&format!("{prefix}def"))?.to_vec();
        let optional = |key: &str| -> Result<Vec<u8>> {
            match bag.get(&format!("{prefix}{key}")) {
                None    => Ok(Vec::new()),
                Some(_) => Ok(bag.bytes(&format!("{prefix}{key}"))?.to_vec()),
            }
        };
        let iv    = optional("iv")?;
        let value = optional("value")?;
        let count = match bag.get(&format!("{prefix}count")) {
            None => None,
            Some(_) => {
                let raw = bag.int(&format!("{prefix}count"))?;
                Some(u64::try_from(raw).map_err(|_| Error::format(format!("negative stage count {raw}")))?)
            }
        };

        let desc = Self { kind, def, iv, value, count };
        desc.validate()?;
        Ok(desc)
    }

    fn validate(&self) -> Result<()> {
        match self.kind {
            StageKind::Compress => {
                self.codec()?;
            }
            kind => {
                let alg = self.algorithm()?;
                if alg.stage_kind() != kind {
                    return Err(Error::format(format!("{kind} stage holds a {} algorithm", alg.stage_kind())));
                }
                if self.iv.len() != alg.iv_len() {
                    return Err(Error::format(format!("{kind} stage has a {}-byte IV", self.iv.len())));
                }
                if kind.is_verifying() && (self.value.is_empty() || self.count.is_none()) {
                    return Err(Error::format(format!("{kind} stage is missing its value")));
                }
            }
        }
        Ok(())
    }

    pub fn algorithm(&self) -> Result<Algorithm> {
        Ok(Algorithm::from_def(&self.def)?)
    }

    pub fn codec(&self) -> Result<CodecId> {
        Ok(CodecId::from_def(&self.def)?)
    }
}

// ── Pipeline assembly ────────────────────────────────────────────────────────

/// Stack the write stages configured in `options` on top of `base`:
/// integrity (outermost), then compression, then the cipher.
pub fn build_writer<'a>(
    base:    Box<dyn StageWrite + 'a>,
    options: &ArchiveOptions,
    keyset:  &Keyset,
    crypto:  &dyn CryptoProvider,
) -> Result<Box<dyn StageWrite + 'a>> {
    let cipher = Algorithm::Aes256GcmStream { segment_size: options.segment_size };
    let iv = crypto.generate_iv(&cipher);
    let transform = crypto.encryptor(&cipher, keyset, &iv)?;
    let mut chain: Box<dyn StageWrite + 'a> = Box::new(EncryptingWriter::new(base, cipher, iv, transform));

    if options.compression != CodecId::None {
        chain = Box::new(CompressWriter::new(chain, options.compression, options.level)?);
    }

    let integrity = match options.integrity {
        Integrity::None   => None,
        Integrity::Digest => Some(Algorithm::Blake3),
        Integrity::Mac    => Some(Algorithm::Blake3Keyed),
    };
    if let Some(alg) = integrity {
        let transform = crypto.digest(&alg, keyset)?;
        chain = Box::new(DigestWriter::new(chain, alg, transform));
    }
    Ok(chain)
}

/// Rebuild the read pipeline for `stages` over `base`.  The innermost
/// stage wraps `base` first, so the returned reader is the outermost.
pub fn build_reader(
    stages: &[StageDescriptor],
    base:   Box<dyn StageRead>,
    keyset: &Keyset,
    crypto: &dyn CryptoProvider,
) -> Result<Box<dyn StageRead>> {
    let mut reader = base;
    for desc in stages.iter().rev() {
        reader = match desc.kind {
            StageKind::Compress => Box::new(CompressReader::new(reader, desc.codec()?)?),
            StageKind::Cipher => {
                let alg = desc.algorithm()?;
                Box::new(DecryptingReader::new(reader, crypto.decryptor(&alg, keyset, &desc.iv)?))
            }
            StageKind::Digest | StageKind::Mac => {
                let alg = desc.algorithm()?;
                Box::new(DigestReader::new(
                    reader,
                    crypto.digest(&alg, keyset)?,
                    desc.value.clone(),
                    desc.count,
                ))
            }
        };
    }
    Ok(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::StdCrypto;
    use crate::stream::testing::{SharedSink, VecSink, VecSource};
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::rc::Rc;

    fn keyset() -> Keyset {
        Keyset::from_parts([8u8; 32], [6u8; 32])
    }

    #[test]
    fn descriptor_properties_read_back() {
        let desc = StageDescriptor {
            kind:  StageKind::Mac,
            def:   Algorithm::Blake3Keyed.to_def(),
            iv:    Vec::new(),
            value: vec![0xAA; 32],
            count: Some(42),
        };
        let mut bag = PropertyBag::new();
        desc.write_properties(&mut bag, "stage.3.");
        assert!(bag.get("stage.3.iv").is_none());
        assert_eq!(StageDescriptor::read_properties(&bag, "stage.3.").unwrap(), desc);
    }

    #[test]
    fn inconsistent_descriptor_is_a_format_error() {
        let mut bag = PropertyBag::new();
        bag.insert("kind", "digest");
        bag.insert("def", Algorithm::Aes256GcmStream { segment_size: 16 }.to_def());
        bag.insert("iv", vec![0u8; 12]);
        let err = StageDescriptor::read_properties(&bag, "").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Format);

        let mut bag = PropertyBag::new();
        bag.insert("kind", "shuffle");
        bag.insert("def", vec![1u8]);
        assert!(StageDescriptor::read_properties(&bag, "").is_err());
    }

    #[test]
    fn full_chain_reads_back_in_stored_order() {
        let options = ArchiveOptions { segment_size: 64, ..ArchiveOptions::default() };
        let data = b"pipeline payload ".repeat(40);

        let stored = Rc::new(RefCell::new(Vec::new()));
        let sink: Box<dyn StageWrite> = Box::new(SharedSink(Rc::clone(&stored)));
        let mut chain = build_writer(sink, &options, &keyset(), &StdCrypto).unwrap();
        chain.write_all(&data).unwrap();
        let out = chain.finish().unwrap();

        let kinds: Vec<StageKind> = out.stages.iter().map(|d| d.kind).collect();
        assert_eq!(kinds, [StageKind::Mac, StageKind::Compress, StageKind::Cipher]);
        assert_eq!(out.stages[0].count, Some(data.len() as u64));
        for desc in &out.stages {
            let mut bag = PropertyBag::new();
            desc.write_properties(&mut bag, "");
            assert_eq!(&StageDescriptor::read_properties(&bag, "").unwrap(), desc);
        }

        let bytes = stored.borrow().clone();
        let mut r = build_reader(&out.stages, Box::new(VecSource::new(bytes.clone())), &keyset(), &StdCrypto).unwrap();
        let mut plain = Vec::new();
        r.read_to_end(&mut plain).unwrap();
        assert_eq!(plain, data);
        r.close().unwrap();

        // Same cipher key, different MAC key: decryption works, the MAC does not.
        let wrong_mac = Keyset::from_parts([8u8; 32], [0u8; 32]);
        let mut r = build_reader(&out.stages, Box::new(VecSource::new(bytes)), &wrong_mac, &StdCrypto).unwrap();
        let mut plain = Vec::new();
        r.read_to_end(&mut plain).unwrap();
        assert_eq!(plain, data);
        assert_eq!(r.close().unwrap_err().kind(), crate::ErrorKind::Integrity);
    }

    #[test]
    fn plain_options_skip_optional_stages() {
        let options = ArchiveOptions {
            compression: CodecId::None,
            integrity:   Integrity::None,
            ..ArchiveOptions::default()
        };
        let sink: Box<dyn StageWrite> = Box::new(VecSink(Vec::new()));
        let mut chain = build_writer(sink, &options, &keyset(), &StdCrypto).unwrap();
        chain.write_all(b"x").unwrap();
        let out = chain.finish().unwrap();
        assert_eq!(out.stages.len(), 1);
        assert_eq!(out.stages[0].kind, StageKind::Cipher);
    }
}
