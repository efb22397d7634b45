use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Compression {
    None,
    Gz,
    Bz2,
    Lz,
    Xz,
}

impl Compression {
    pub const ALL: [Compression; 5] = [
        Compression::None,
        Compression::Gz,
        Compression::Bz2,
        Compression::Lz,
        Compression::Xz,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            Compression::None => "",
            Compression::Gz => ".gz",
            Compression::Bz2 => ".bz2",
            Compression::Lz => ".lz",
            Compression::Xz => ".xz",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Position {
    Current,
    Index(u64),
    Dated(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub path: PathBuf,
    pub position: Position,
    pub compression: Compression,
}

impl Member {
    pub fn index(&self) -> Option<u64> {
        match self.position {
            Position::Index(index) => Some(index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Family {
    pub dir: PathBuf,
    pub prefix: String,
    pub separator: String,
    pub suffix: String,
}

impl Family {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
        separator: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
            separator: separator.into(),
            suffix: suffix.into(),
        }
    }

    pub fn from_template(template: &Path, separator: &str, suffix: &str) -> Option<Self> {
        let prefix = template.file_name()?.to_string_lossy().to_string();
        let dir = match template.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Some(Self::new(dir, prefix, separator, suffix))
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}{}", self.prefix, self.suffix))
    }

    pub fn numbered_name(&self, index: u64, compression: Compression) -> String {
        format!(
            "{}{}{}{}{}",
            self.prefix,
            self.separator,
            index,
            self.suffix,
            compression.extension()
        )
    }

    pub fn numbered_path(&self, index: u64, compression: Compression) -> PathBuf {
        self.dir.join(self.numbered_name(index, compression))
    }

    pub fn dated_path(&self, when: DateTime<Local>, date_format: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{}{}{}",
            self.prefix,
            self.separator,
            when.format(date_format),
            self.suffix
        ))
    }

    pub fn target_path(
        &self,
        layout: crate::types::Layout,
        when: DateTime<Local>,
        date_format: &str,
    ) -> PathBuf {
        match layout {
            crate::types::Layout::Date => self.dated_path(when, date_format),
            _ => self.current_path(),
        }
    }

    fn strip_compression<'a>(&self, name: &'a str) -> Vec<(&'a str, Compression)> {
        Compression::ALL
            .iter()
            .filter_map(|c| name.strip_suffix(c.extension()).map(|rest| (rest, *c)))
            .collect()
    }

    pub fn parse_current(&self, name: &str) -> Option<Compression> {
        let current = format!("{}{}", self.prefix, self.suffix);
        self.strip_compression(name)
            .into_iter()
            .find(|(rest, _)| *rest == current)
            .map(|(_, c)| c)
    }

    /// Recognize `prefix SEP <digits> suffix [.ext]`. Digits must make up the
    /// whole slot, so `backup.50` is index 50 and never index 5.
    pub fn parse_numbered(&self, name: &str) -> Option<(u64, Compression)> {
        let lead = format!("{}{}", self.prefix, self.separator);
        let rest = name.strip_prefix(lead.as_str())?;
        for (body, compression) in self.strip_compression(rest) {
            let Some(digits) = body.strip_suffix(self.suffix.as_str()) else {
                continue;
            };
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if let Ok(index) = digits.parse::<u64>() {
                return Some((index, compression));
            }
        }
        None
    }

    pub fn parse_dated(&self, name: &str) -> Option<(String, Compression)> {
        let lead = format!("{}{}", self.prefix, self.separator);
        let rest = name.strip_prefix(lead.as_str())?;
        // Compressed readings first, otherwise `x.2025-01-31.gz` would yield
        // the date text `2025-01-31.gz`.
        for (body, compression) in self.strip_compression(rest).into_iter().rev() {
            let Some(date) = body.strip_suffix(self.suffix.as_str()) else {
                continue;
            };
            if !date.is_empty() && !date.contains('/') {
                return Some((date.to_string(), compression));
            }
        }
        None
    }
}
