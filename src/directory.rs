//! Archive directory: the sorted entry table plus the optional header entry.
//!
//! # Wire format
//! ```text
//! entry;entry;...;header
//! ```
//! Each part is one [`PropertyBag`] token.  Standard entries:
//!
//! | key | value |
//! |-----|-------|
//! | `type` | `s:entry` |
//! | `name` | logical name |
//! | `store` | storage name in the container |
//! | `size` / `stored` | original / stored byte counts |
//! | `stages` | number of stage descriptors |
//! | `stage.<i>.*` | descriptor `i`, outermost first (see [`crate::stage`]) |
//! | `prop.<key>` | user properties |
//!
//! The header entry carries `type=s:header`, `store` and `verifier`.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::props::{split_unescaped, PropValue, PropertyBag, RECORD_DELIMITER};
use crate::stage::StageDescriptor;

const KEY_TYPE:     &str = "type";
const KEY_NAME:     &str = "name";
const KEY_STORE:    &str = "store";
const KEY_SIZE:     &str = "size";
const KEY_STORED:   &str = "stored";
const KEY_STAGES:   &str = "stages";
const KEY_VERIFIER: &str = "verifier";
const TYPE_ENTRY:   &str = "entry";
const TYPE_HEADER:  &str = "header";
const STAGE_PREFIX: &str = "stage.";
const PROP_PREFIX:  &str = "prop.";

/// Identity of one in-memory directory.  Entries carry it instead of a
/// reference to the directory that owns them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirectoryId(Uuid);

impl DirectoryId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

// ── Entries ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardEntry {
    directory:       DirectoryId,
    pub name:        String,
    /// Record name in the container: the logical name for plain archives,
    /// an anonymous slot id for encrypted ones.
    pub storage:     String,
    pub size:        u64,
    pub stored_size: u64,
    /// Outermost first.
    pub stages:      Vec<StageDescriptor>,
    pub properties:  PropertyBag,
}

impl StandardEntry {
    fn new(directory: DirectoryId, name: &str) -> Self {
        Self {
            directory,
            name:        name.to_owned(),
            storage:     name.to_owned(),
            size:        0,
            stored_size: 0,
            stages:      Vec::new(),
            properties:  PropertyBag::new(),
        }
    }

    pub fn directory(&self) -> DirectoryId {
        self.directory
    }

    pub fn property(&self, key: &str) -> Option<&PropValue> {
        self.properties.get(key)
    }

    fn to_properties(&self) -> PropertyBag {
        let mut bag = PropertyBag::new();
        bag.insert(KEY_TYPE, TYPE_ENTRY);
        bag.insert(KEY_NAME, self.name.as_str());
        bag.insert(KEY_STORE, self.storage.as_str());
        bag.insert(KEY_SIZE, self.size as i64);
        bag.insert(KEY_STORED, self.stored_size as i64);
        bag.insert(KEY_STAGES, self.stages.len() as i64);
        for (i, stage) in self.stages.iter().enumerate() {
            stage.write_properties(&mut bag, &format!("{STAGE_PREFIX}{i}."));
        }
        for (key, value) in self.properties.iter() {
            bag.insert(format!("{PROP_PREFIX}{key}"), value.clone());
        }
        bag
    }

    fn from_properties(directory: DirectoryId, bag: &PropertyBag) -> Result<Self> {
        let mut entry = Self::new(directory, bag.str(KEY_NAME)?);
        entry.storage     = bag.str(KEY_STORE)?.to_owned();
        entry.size        = non_negative(bag, KEY_SIZE)?;
        entry.stored_size = non_negative(bag, KEY_STORED)?;

        let count = non_negative(bag, KEY_STAGES)?;
        for i in 0..count {
            let stage = StageDescriptor::read_properties(bag, &format!("{STAGE_PREFIX}{i}."))?;
            entry.stages.push(stage);
        }
        for (key, value) in bag.iter() {
            if let Some(user_key) = key.strip_prefix(PROP_PREFIX) {
                entry.properties.insert(user_key, value.clone());
            }
        }
        Ok(entry)
    }
}

fn non_negative(bag: &PropertyBag, key: &str) -> Result<u64> {
    let raw = bag.int(key)?;
    u64::try_from(raw).map_err(|_| Error::format(format!("property '{key}' is negative ({raw})")))
}

/// The directory's own entry: where the encrypted directory is stored and
/// the verifier it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderEntry {
    directory:    DirectoryId,
    pub storage:  String,
    pub verifier: Vec<u8>,
}

impl HeaderEntry {
    pub fn directory(&self) -> DirectoryId {
        self.directory
    }

    fn to_properties(&self) -> PropertyBag {
        let mut bag = PropertyBag::new();
        bag.insert(KEY_TYPE, TYPE_HEADER);
        bag.insert(KEY_STORE, self.storage.as_str());
        bag.insert(KEY_VERIFIER, self.verifier.clone());
        bag
    }

    fn from_properties(directory: DirectoryId, bag: &PropertyBag) -> Result<Self> {
        Ok(Self {
            directory,
            storage:  bag.str(KEY_STORE)?.to_owned(),
            verifier: bag.bytes(KEY_VERIFIER)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Standard(StandardEntry),
    Header(HeaderEntry),
}

impl Entry {
    pub fn storage(&self) -> &str {
        match self {
            Entry::Standard(e) => &e.storage,
            Entry::Header(h)   => &h.storage,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Entry::Standard(e) => e.to_properties().encode(),
            Entry::Header(h)   => h.to_properties().encode(),
        }
    }

    fn decode(directory: DirectoryId, token: &str) -> Result<Self> {
        let bag = PropertyBag::decode(token)?;
        match bag.str(KEY_TYPE)? {
            TYPE_ENTRY  => Ok(Entry::Standard(StandardEntry::from_properties(directory, &bag)?)),
            TYPE_HEADER => Ok(Entry::Header(HeaderEntry::from_properties(directory, &bag)?)),
            other       => Err(Error::format(format!("unknown entry type '{other}'"))),
        }
    }
}

// ── Directory ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ArchiveDirectory {
    id:      DirectoryId,
    entries: Vec<StandardEntry>,
    header:  Option<HeaderEntry>,
}

impl Default for ArchiveDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveDirectory {
    pub fn new() -> Self {
        Self {
            id:      DirectoryId::new(),
            entries: Vec::new(),
            header:  None,
        }
    }

    pub fn id(&self) -> DirectoryId {
        self.id
    }

    /// Whether `entry` was handed out by this directory instance.
    pub fn owns(&self, entry: &StandardEntry) -> bool {
        entry.directory == self.id
    }

    fn position(&self, name: &str) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.name.as_str().cmp(name))
    }

    /// Insert a new standard entry, keeping the table sorted by name.
    pub fn add_entry(&mut self, name: &str) -> Result<&mut StandardEntry> {
        match self.position(name) {
            Ok(_) => Err(Error::logic(format!("duplicate entry name '{name}'"))),
            Err(at) => {
                self.entries.insert(at, StandardEntry::new(self.id, name));
                Ok(&mut self.entries[at])
            }
        }
    }

    /// Create the header entry, or replace the existing one.
    pub fn add_header(&mut self, storage: &str) -> &mut HeaderEntry {
        self.header.insert(HeaderEntry {
            directory: self.id,
            storage:   storage.to_owned(),
            verifier:  Vec::new(),
        })
    }

    pub fn header(&self) -> Option<&HeaderEntry> {
        self.header.as_ref()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&StandardEntry> {
        self.position(name).ok().map(|i| &self.entries[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_ok()
    }

    /// Standard entries in name order.  The header is never included.
    pub fn iter(&self) -> std::slice::Iter<'_, StandardEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode_all(&self) -> String {
        let mut tokens: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.to_properties().encode())
            .collect();
        if let Some(header) = &self.header {
            tokens.push(header.to_properties().encode());
        }
        tokens.join(&RECORD_DELIMITER.to_string())
    }

    /// Rebuild a directory from [`encode_all`](Self::encode_all) output.
    /// No header token means an unencrypted archive.
    pub fn decode_all(text: &str) -> Result<Self> {
        let mut dir = Self::new();
        if text.is_empty() {
            return Ok(dir);
        }
        for token in split_unescaped(text, RECORD_DELIMITER)? {
            match Entry::decode(dir.id, token)? {
                Entry::Standard(entry) => match dir.position(&entry.name) {
                    Ok(_) => {
                        return Err(Error::format(format!("entry '{}' listed twice", entry.name)));
                    }
                    Err(at) => dir.entries.insert(at, entry),
                },
                Entry::Header(header) => {
                    if dir.header.is_some() {
                        return Err(Error::format("directory holds more than one header"));
                    }
                    dir.header = Some(header);
                }
            }
        }
        Ok(dir)
    }
}

impl<'a> IntoIterator for &'a ArchiveDirectory {
    type Item = &'a StandardEntry;
    type IntoIter = std::slice::Iter<'a, StandardEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
