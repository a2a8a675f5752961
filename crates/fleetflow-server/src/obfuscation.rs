// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reversible obfuscation of query names sent to clients.
//!
//! An obfuscated name is `$` followed by the base64url encoding of the name
//! XORed with a SHA-256 keystream derived from the server key. Without a key
//! names pass through unchanged.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

const PREFIX: char = '$';

#[derive(Clone, Default)]
pub struct Obfuscator {
    key: Option<[u8; 32]>,
}

impl std::fmt::Debug for Obfuscator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Obfuscator")
            .field("enabled", &self.key.is_some())
            .finish()
    }
}

impl Obfuscator {
    pub fn new(key: Option<&str>) -> Self {
        Self {
            key: key.map(|k| Sha256::digest(k.as_bytes()).into()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    fn apply(&self, key: &[u8; 32], data: &mut [u8]) {
        for (block, chunk) in data.chunks_mut(32).enumerate() {
            let mut hasher = Sha256::new();
            hasher.update(key);
            hasher.update((block as u64).to_le_bytes());
            let stream = hasher.finalize();
            for (byte, k) in chunk.iter_mut().zip(stream.iter()) {
                *byte ^= k;
            }
        }
    }

    pub fn obfuscate(&self, name: &str) -> String {
        let Some(key) = &self.key else {
            return name.to_string();
        };
        let mut data = name.as_bytes().to_vec();
        self.apply(key, &mut data);
        format!("{}{}", PREFIX, URL_SAFE_NO_PAD.encode(data))
    }

    /// Reverse [`obfuscate`](Self::obfuscate). Anything that does not decode
    /// is returned unchanged.
    pub fn deobfuscate(&self, name: &str) -> String {
        self.try_deobfuscate(name)
            .unwrap_or_else(|| name.to_string())
    }

    fn try_deobfuscate(&self, name: &str) -> Option<String> {
        let key = self.key.as_ref()?;
        let encoded = name.strip_prefix(PREFIX)?;
        let mut data = URL_SAFE_NO_PAD.decode(encoded).ok()?;
        self.apply(key, &mut data);
        String::from_utf8(data).ok()
    }

    /// Rewrite every `$token` in free text that decodes to a name.
    pub fn deobfuscate_text(&self, text: &str) -> String {
        if self.key.is_none() || !text.contains(PREFIX) {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(pos) = rest.find(PREFIX) {
            out.push_str(&rest[..pos]);
            let candidate = &rest[pos..];
            let token_len = candidate[1..]
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
                .unwrap_or(candidate.len() - 1)
                + 1;
            let token = &candidate[..token_len];
            match self.try_deobfuscate(token) {
                Some(name) if token_len > 1 => out.push_str(&name),
                _ => out.push_str(token),
            }
            rest = &candidate[token_len..];
        }
        out.push_str(rest);
        out
    }
}
