use std::{collections::HashMap, path::Path};

use gvmi_core::{Va, VmiError};

/// Symbol type characters that carry an address: text, data, read-only
/// data and BSS, in both global and local form.
const SYMBOL_TYPES: &[char] = &['T', 't', 'D', 'd', 'R', 'r', 'B', 'b'];

/// A parsed Linux `System.map` file.
///
/// Lines have the form `<hex-address> <type-char> <symbol>`; only
/// symbol-bearing type characters are kept.
#[derive(Debug, Default)]
pub struct SystemMap {
    forward: HashMap<String, Va>,
    reverse: HashMap<Va, String>,
}

impl SystemMap {
    /// Parses a system map from its textual content.
    pub fn parse(content: &str) -> Self {
        let mut forward = HashMap::new();
        let mut reverse = HashMap::new();

        for line in content.lines() {
            let mut parts = line.split_whitespace();

            let (address, typ, symbol) = match (parts.next(), parts.next(), parts.next()) {
                (Some(address), Some(typ), Some(symbol)) => (address, typ, symbol),
                _ => continue,
            };

            let typ = match typ.chars().next() {
                Some(typ) => typ,
                None => continue,
            };

            if typ.len_utf8() != 1 || !SYMBOL_TYPES.contains(&typ) {
                continue;
            }

            let address = match u64::from_str_radix(address, 16) {
                Ok(address) => Va(address),
                Err(_) => continue,
            };

            forward.insert(symbol.to_string(), address);
            reverse.entry(address).or_insert_with(|| symbol.to_string());
        }

        tracing::debug!(symbols = forward.len(), "parsed system map");

        Self { forward, reverse }
    }

    /// Loads and parses a system map file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VmiError> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// Resolves a symbol to its virtual address.
    pub fn lookup(&self, symbol: &str) -> Option<Va> {
        self.forward.get(symbol).copied()
    }

    /// Resolves a virtual address back to its symbol, if one starts there.
    pub fn lookup_address(&self, address: Va) -> Option<&str> {
        self.reverse.get(&address).map(String::as_str)
    }

    /// Returns the number of symbols in the map.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Checks whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}
