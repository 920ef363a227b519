use crate::mutator::Mutator;
use rand::Rng;
use rand_core::RngCore;
use std::collections::BTreeMap;

const HTTP_TOKENS: &[&[u8]] = &[
    b"GET",
    b"POST",
    b"PUT",
    b"DELETE",
    b"HEAD",
    b"OPTIONS",
    b"PATCH",
    b"HTTP/1.0",
    b"HTTP/1.1",
    b"Host:",
    b"Content-Length:",
    b"Content-Type:",
    b"Transfer-Encoding: chunked",
    b"Connection: keep-alive",
    b"Cookie:",
    b"\r\n",
    b"\r\n\r\n",
    b"../",
    b"%00",
    b"%n",
];

const DNS_TOKENS: &[&[u8]] = &[
    b"\x00\x01",
    b"\x00\x02",
    b"\x00\x05",
    b"\x00\x0f",
    b"\x00\x10",
    b"\x00\x1c",
    b"\x00\xff",
    b"\xc0\x0c",
    b"\xc0\xff",
    b"\x3f",
    b"\x00",
];

const SMTP_TOKENS: &[&[u8]] = &[
    b"HELO",
    b"EHLO",
    b"MAIL FROM:",
    b"RCPT TO:",
    b"DATA",
    b"QUIT",
    b"RSET",
    b"VRFY",
    b"AUTH LOGIN",
    b"STARTTLS",
    b"\r\n.\r\n",
    b"<>",
];

const SQL_TOKENS: &[&[u8]] = &[
    b"' OR '1'='1",
    b"'; DROP TABLE",
    b"\" OR \"1\"=\"1",
    b"UNION SELECT",
    b"--",
    b"/*",
    b"1=1",
];

const COMMAND_TOKENS: &[&[u8]] = &[
    b"; ls",
    b"| id",
    b"`id`",
    b"$(id)",
    b"&& whoami",
    b"\n/bin/sh",
    b"../../../../etc/passwd",
];

/// Protocol token sets keyed by protocol name.
#[derive(Debug, Clone)]
pub struct Dictionary {
    tokens: BTreeMap<String, Vec<Vec<u8>>>,
}

impl Default for Dictionary {
    fn default() -> Self {
        let builtin: [(&str, &[&[u8]]); 5] = [
            ("http", HTTP_TOKENS),
            ("dns", DNS_TOKENS),
            ("smtp", SMTP_TOKENS),
            ("sql", SQL_TOKENS),
            ("command", COMMAND_TOKENS),
        ];
        let tokens = builtin
            .into_iter()
            .map(|(name, list)| (name.to_string(), list.iter().map(|t| t.to_vec()).collect()))
            .collect();
        Self { tokens }
    }
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.tokens.keys().map(String::as_str)
    }

    pub fn tokens(&self, protocol: &str) -> Option<&[Vec<u8>]> {
        self.tokens.get(protocol).map(Vec::as_slice)
    }

    /// Adds tokens under `protocol`, creating the set if needed. Empty tokens
    /// are dropped.
    pub fn add_tokens<I>(&mut self, protocol: &str, tokens: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let set = self.tokens.entry(protocol.to_string()).or_default();
        set.extend(tokens.into_iter().filter(|t| !t.is_empty()));
    }

    /// Picks a token from `protocol`, or from every set when the protocol is
    /// absent or unknown.
    pub fn random_token(&self, protocol: Option<&str>, rng: &mut dyn RngCore) -> Option<&[u8]> {
        if let Some(set) = protocol.and_then(|p| self.tokens.get(p)) {
            if !set.is_empty() {
                return Some(set[rng.random_range(0..set.len())].as_slice());
            }
        }
        let total: usize = self.tokens.values().map(Vec::len).sum();
        if total == 0 {
            return None;
        }
        let mut pick = rng.random_range(0..total);
        for set in self.tokens.values() {
            if pick < set.len() {
                return Some(set[pick].as_slice());
            }
            pick -= set.len();
        }
        None
    }

    /// Inserts a token at a random offset. Empty input stays empty.
    pub fn inject(&self, data: &[u8], protocol: Option<&str>, rng: &mut dyn RngCore) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        let Some(token) = self.random_token(protocol, rng) else {
            return data.to_vec();
        };
        let pos = rng.random_range(0..=data.len());
        let mut out = Vec::with_capacity(data.len() + token.len());
        out.extend_from_slice(&data[..pos]);
        out.extend_from_slice(token);
        out.extend_from_slice(&data[pos..]);
        out
    }

    /// Replaces `data[start..end]` with a token. The range is clamped to the
    /// input.
    pub fn replace(
        &self,
        data: &[u8],
        start: usize,
        end: usize,
        protocol: Option<&str>,
        rng: &mut dyn RngCore,
    ) -> Vec<u8> {
        let start = start.min(data.len());
        let end = end.clamp(start, data.len());
        let Some(token) = self.random_token(protocol, rng) else {
            return data.to_vec();
        };
        let mut out = Vec::with_capacity(data.len() - (end - start) + token.len());
        out.extend_from_slice(&data[..start]);
        out.extend_from_slice(token);
        out.extend_from_slice(&data[end..]);
        out
    }

    /// Writes a token over the input starting at a random offset, extending
    /// the input if the token runs past its end.
    pub fn overwrite(&self, data: &[u8], protocol: Option<&str>, rng: &mut dyn RngCore) -> Vec<u8> {
        if data.is_empty() {
            return Vec::new();
        }
        let Some(token) = self.random_token(protocol, rng) else {
            return data.to_vec();
        };
        let pos = rng.random_range(0..data.len());
        let mut out = data.to_vec();
        let end = pos + token.len();
        if end > out.len() {
            out.resize(end, 0);
        }
        out[pos..end].copy_from_slice(token);
        out
    }
}

/// Injects or overlays protocol tokens. Never shrinks its input.
#[derive(Debug, Clone, Default)]
pub struct DictionaryMutator {
    dictionary: Dictionary,
    protocol: Option<String>,
}

impl DictionaryMutator {
    pub fn new(protocol: Option<String>) -> Self {
        Self {
            dictionary: Dictionary::default(),
            protocol,
        }
    }

    pub fn dictionary_mut(&mut self) -> &mut Dictionary {
        &mut self.dictionary
    }
}

impl Mutator for DictionaryMutator {
    fn name(&self) -> &str {
        "dictionary"
    }

    fn mutate(&mut self, data: &[u8], rng: &mut dyn RngCore) -> Vec<u8> {
        let protocol = self.protocol.as_deref();
        if rng.random_bool(0.5) {
            self.dictionary.inject(data, protocol, rng)
        } else {
            self.dictionary.overwrite(data, protocol, rng)
        }
    }
}
