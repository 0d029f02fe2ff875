//! Trunk binlog line format
//!
//! ```text
//! <timestamp> <op_type> <store_path_index> <sub_path_high> <sub_path_low> <file_id> <offset> <size>\n
//! ```

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of one binlog line, newline included
pub const TRUNK_BINLOG_LINE_SIZE: usize = 128;

const COLUMN_COUNT: usize = 8;

/// Trunk space operation recorded in the binlog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TrunkOpType {
    AddSpace = b'A',
    DelSpace = b'D',
}

impl TrunkOpType {
    pub fn as_char(self) -> char {
        self as u8 as char
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(TrunkOpType::AddSpace),
            'D' => Some(TrunkOpType::DelSpace),
            _ => None,
        }
    }
}

/// Location and extent of a trunk slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrunkFullInfo {
    pub store_path_index: u32,
    pub sub_path_high: u32,
    pub sub_path_low: u32,
    /// Id of the trunk file the slot lives in
    pub file_id: u32,
    pub offset: u32,
    pub size: u32,
}

/// One binlog line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrunkBinlogRecord {
    pub timestamp: i64,
    pub op_type: TrunkOpType,
    pub trunk: TrunkFullInfo,
}

impl TrunkBinlogRecord {
    pub fn new(timestamp: i64, op_type: TrunkOpType, trunk: TrunkFullInfo) -> Self {
        Self {
            timestamp,
            op_type,
            trunk,
        }
    }

    /// The record rendered as a newline-terminated line
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for TrunkBinlogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} {} {}",
            self.timestamp,
            self.op_type.as_char(),
            self.trunk.store_path_index,
            self.trunk.sub_path_high,
            self.trunk.sub_path_low,
            self.trunk.file_id,
            self.trunk.offset,
            self.trunk.size
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordParseError {
    #[error("read item count: {found} < {}", COLUMN_COUNT)]
    ColumnCount { found: usize },

    #[error("column {column}: invalid integer {value:?}")]
    Integer { column: usize, value: String },

    #[error("invalid op type {0:?}")]
    OpType(String),
}

fn parse_column<T: FromStr>(cols: &[&str], column: usize) -> Result<T, RecordParseError> {
    cols[column].parse().map_err(|_| RecordParseError::Integer {
        column,
        value: cols[column].to_string(),
    })
}

impl FromStr for TrunkBinlogRecord {
    type Err = RecordParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim_end_matches(['\n', '\r']);
        let cols: Vec<&str> = line.splitn(COLUMN_COUNT, ' ').collect();
        if cols.len() < COLUMN_COUNT {
            return Err(RecordParseError::ColumnCount { found: cols.len() });
        }

        let mut op_chars = cols[1].chars();
        let op_type = match (op_chars.next(), op_chars.next()) {
            (Some(c), None) => TrunkOpType::from_char(c),
            _ => None,
        }
        .ok_or_else(|| RecordParseError::OpType(cols[1].to_string()))?;

        Ok(Self {
            timestamp: parse_column(&cols, 0)?,
            op_type,
            trunk: TrunkFullInfo {
                store_path_index: parse_column(&cols, 2)?,
                sub_path_high: parse_column(&cols, 3)?,
                sub_path_low: parse_column(&cols, 4)?,
                file_id: parse_column(&cols, 5)?,
                offset: parse_column(&cols, 6)?,
                size: parse_column(&cols, 7)?,
            },
        })
    }
}
