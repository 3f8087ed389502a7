//! Registry value types and UTF-16LE encoding helpers.

/// Registry value type tags, as stored in `vk` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegType {
    /// `REG_NONE` (0).
    None,
    /// `REG_SZ` (1): UTF-16LE string with NUL terminator.
    Sz,
    /// `REG_EXPAND_SZ` (2): UTF-16LE string with `%VAR%` references.
    ExpandSz,
    /// `REG_BINARY` (3): raw bytes.
    Binary,
    /// `REG_DWORD` (4): 32-bit little-endian integer.
    Dword,
    /// `REG_MULTI_SZ` (7): NUL-separated UTF-16LE strings, double-NUL end.
    MultiSz,
    /// Any other type; the raw tag is preserved.
    Other(u32),
}

impl RegType {
    /// Converts an on-disk type tag.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Sz,
            2 => Self::ExpandSz,
            3 => Self::Binary,
            4 => Self::Dword,
            7 => Self::MultiSz,
            other => Self::Other(other),
        }
    }

    /// Returns the on-disk type tag.
    pub fn to_raw(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Sz => 1,
            Self::ExpandSz => 2,
            Self::Binary => 3,
            Self::Dword => 4,
            Self::MultiSz => 7,
            Self::Other(raw) => raw,
        }
    }
}

/// A registry value: a type tag plus its exact data bytes.
///
/// Data is stored raw so that round-trips preserve every byte; the typed
/// constructors and accessors do the UTF-16LE work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegValue {
    /// The value type.
    pub vtype: RegType,
    /// Raw data bytes, exactly as stored in the hive.
    pub data: Vec<u8>,
}

impl RegValue {
    /// `REG_SZ` from a Rust string (adds the UTF-16LE NUL terminator).
    pub fn sz(s: &str) -> Self {
        Self {
            vtype: RegType::Sz,
            data: utf16le(s),
        }
    }

    /// `REG_EXPAND_SZ` from a Rust string.
    pub fn expand_sz(s: &str) -> Self {
        Self {
            vtype: RegType::ExpandSz,
            data: utf16le(s),
        }
    }

    /// `REG_MULTI_SZ` from a string list (NUL-separated, double-NUL end).
    pub fn multi_sz(strings: &[&str]) -> Self {
        let mut data = Vec::new();
        for s in strings {
            data.extend_from_slice(&utf16le(s));
        }
        data.extend_from_slice(&[0, 0]);
        Self {
            vtype: RegType::MultiSz,
            data,
        }
    }

    /// `REG_DWORD` from an integer.
    pub fn dword(n: u32) -> Self {
        Self {
            vtype: RegType::Dword,
            data: n.to_le_bytes().to_vec(),
        }
    }

    /// `REG_BINARY` from raw bytes.
    pub fn binary(data: &[u8]) -> Self {
        Self {
            vtype: RegType::Binary,
            data: data.to_vec(),
        }
    }

    /// `REG_NONE` with empty data.
    pub fn none() -> Self {
        Self {
            vtype: RegType::None,
            data: Vec::new(),
        }
    }

    /// Decodes `REG_SZ`/`REG_EXPAND_SZ` data as a string, dropping the
    /// NUL terminator. Returns `None` for other types.
    pub fn as_string(&self) -> Option<String> {
        match self.vtype {
            RegType::Sz | RegType::ExpandSz => Some(from_utf16le(&self.data)),
            _ => None,
        }
    }

    /// Decodes `REG_MULTI_SZ` data into its component strings (empty
    /// entries included, terminator excluded).
    pub fn as_multi_sz(&self) -> Option<Vec<String>> {
        if self.vtype != RegType::MultiSz {
            return None;
        }
        let units = to_units(&self.data);
        // Strip the trailing empty string produced by the double NUL.
        let mut out: Vec<String> = units
            .split(|&u| u == 0)
            .map(|chunk| String::from_utf16_lossy(chunk))
            .collect();
        while out.last().is_some_and(|s| s.is_empty()) {
            out.pop();
        }
        Some(out)
    }

    /// Decodes `REG_DWORD` data. Returns `None` for other types or
    /// short data.
    pub fn as_dword(&self) -> Option<u32> {
        if self.vtype != RegType::Dword || self.data.len() < 4 {
            return None;
        }
        Some(u32::from_le_bytes([
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
        ]))
    }
}

/// Encodes a string as UTF-16LE **with** a trailing NUL.
pub fn utf16le(s: &str) -> Vec<u8> {
    let mut out = utf16le_of(s);
    out.extend_from_slice(&[0, 0]);
    out
}

/// Encodes a string as UTF-16LE **without** a terminator.
pub fn utf16le_of(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

/// Decodes UTF-16LE bytes into a string, stopping at the first NUL.
pub(crate) fn from_utf16le(data: &[u8]) -> String {
    let units = to_units(data);
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

/// Reinterprets a byte slice as little-endian u16 code units.
fn to_units(data: &[u8]) -> Vec<u16> {
    data.chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sz_round_trip_includes_terminator() {
        let v = RegValue::sz("viostor");
        assert_eq!(v.data.len(), "viostor".len() * 2 + 2);
        assert_eq!(&v.data[v.data.len() - 2..], &[0, 0]);
        assert_eq!(v.as_string().unwrap(), "viostor");
    }

    #[test]
    fn multi_sz_round_trip_and_double_nul() {
        let v = RegValue::multi_sz(&["PartMgr", "prl_strg"]);
        assert_eq!(&v.data[v.data.len() - 4..], &[0, 0, 0, 0]);
        assert_eq!(v.as_multi_sz().unwrap(), vec!["PartMgr", "prl_strg"]);
    }

    #[test]
    fn multi_sz_empty_list_is_single_double_nul() {
        let v = RegValue::multi_sz(&[]);
        assert_eq!(v.data, vec![0, 0]);
        assert!(v.as_multi_sz().unwrap().is_empty());
    }

    #[test]
    fn dword_little_endian() {
        let v = RegValue::dword(4);
        assert_eq!(v.data, vec![4, 0, 0, 0]);
        assert_eq!(v.as_dword(), Some(4));
    }
}
