//! `Cache-Control` directives.

use std::fmt::Write as _;

use bytes::BytesMut;

/// Cache-control bits, shared between replies and objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CacheFlags(u32);

impl CacheFlags {
    pub const NONE: Self = Self(0);
    pub const NO: Self = Self(1 << 0);
    pub const NO_STORE: Self = Self(1 << 1);
    /// Never serve to a client other than the one that fetched it.
    pub const NO_HIDDEN: Self = Self(1 << 2);
    pub const PRIVATE: Self = Self(1 << 3);
    pub const PUBLIC: Self = Self(1 << 4);
    pub const NO_TRANSFORM: Self = Self(1 << 5);
    pub const MUST_REVALIDATE: Self = Self(1 << 6);
    pub const PROXY_REVALIDATE: Self = Self(1 << 7);
    pub const ONLY_IF_CACHED: Self = Self(1 << 8);
    /// The request carried `Authorization`.
    pub const AUTHORIZATION: Self = Self(1 << 9);
    pub const VARY: Self = Self(1 << 10);
    pub const COOKIE: Self = Self(1 << 11);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for CacheFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CacheFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Parsed directives plus the numeric arguments we act on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub flags: CacheFlags,
    pub max_age: Option<u32>,
    pub s_maxage: Option<u32>,
    pub min_fresh: Option<u32>,
    pub max_stale: Option<u32>,
}

/// Split a header value on commas outside quoted strings.
fn directives(value: &str) -> impl Iterator<Item = &str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts.into_iter().map(str::trim).filter(|d| !d.is_empty())
}

fn seconds(arg: Option<&str>) -> Option<u32> {
    let arg = arg?.trim().trim_matches('"');
    // Overlong values saturate rather than fail.
    match arg.parse::<u64>() {
        Ok(v) => Some(v.min(u32::MAX as u64) as u32),
        Err(_) => None,
    }
}

impl CacheControl {
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();
        cc.merge_header(value);
        cc
    }

    /// Fold one `Cache-Control` header value into `self`.
    pub fn merge_header(&mut self, value: &str) {
        for directive in directives(value) {
            let (name, arg) = match directive.split_once('=') {
                Some((n, a)) => (n.trim(), Some(a)),
                None => (directive, None),
            };
            match name.to_ascii_lowercase().as_str() {
                // `no-cache="field"` still means revalidate.
                "no-cache" => self.flags.insert(CacheFlags::NO),
                "no-store" => self.flags.insert(CacheFlags::NO_STORE),
                "private" => self.flags.insert(CacheFlags::PRIVATE),
                "public" => self.flags.insert(CacheFlags::PUBLIC),
                "no-transform" => self.flags.insert(CacheFlags::NO_TRANSFORM),
                "must-revalidate" => self.flags.insert(CacheFlags::MUST_REVALIDATE),
                "proxy-revalidate" => self.flags.insert(CacheFlags::PROXY_REVALIDATE),
                "only-if-cached" => self.flags.insert(CacheFlags::ONLY_IF_CACHED),
                "max-age" => {
                    if let Some(v) = seconds(arg) {
                        self.max_age = Some(v);
                    }
                }
                "s-maxage" => {
                    if let Some(v) = seconds(arg) {
                        self.s_maxage = Some(v);
                    }
                }
                "min-fresh" => self.min_fresh = seconds(arg).or(self.min_fresh),
                "max-stale" => self.max_stale = seconds(arg).or(Some(u32::MAX)),
                _ => {}
            }
        }
    }

    /// Append a request `Cache-Control` line if any request directive is set.
    pub fn write_request_header(&self, out: &mut BytesMut) {
        let mut parts: Vec<String> = Vec::new();
        if self.flags.contains(CacheFlags::NO) {
            parts.push("no-cache".into());
        }
        if self.flags.contains(CacheFlags::NO_STORE) {
            parts.push("no-store".into());
        }
        if self.flags.contains(CacheFlags::NO_TRANSFORM) {
            parts.push("no-transform".into());
        }
        if self.flags.contains(CacheFlags::ONLY_IF_CACHED) {
            parts.push("only-if-cached".into());
        }
        if let Some(v) = self.max_age {
            parts.push(format!("max-age={}", v));
        }
        if let Some(v) = self.min_fresh {
            parts.push(format!("min-fresh={}", v));
        }
        match self.max_stale {
            Some(u32::MAX) => parts.push("max-stale".into()),
            Some(v) => parts.push(format!("max-stale={}", v)),
            None => {}
        }
        if parts.is_empty() {
            return;
        }
        let mut line = String::from("Cache-Control: ");
        line.push_str(&parts.join(", "));
        let _ = write!(line, "\r\n");
        out.extend_from_slice(line.as_bytes());
    }
}
