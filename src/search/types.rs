use serde::{Deserialize, Serialize};
use std::fmt;

/// Value interpretation used for query encoding, matching and display.
///
/// Ids are stable across the client boundary; never reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Byte,
    Word,
    Dword,
    Qword,
    Float,
    Double,
    Xor,
    Utf8,
    Utf16LE,
    Hex,
    HexMixed,
    Arm,
    Arm64,
    Auto,
}

impl ValueType {
    #[inline]
    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(Self::Byte),
            1 => Some(Self::Word),
            2 => Some(Self::Dword),
            3 => Some(Self::Qword),
            4 => Some(Self::Float),
            5 => Some(Self::Double),
            6 => Some(Self::Xor),
            7 => Some(Self::Utf8),
            8 => Some(Self::Utf16LE),
            9 => Some(Self::Hex),
            10 => Some(Self::HexMixed),
            11 => Some(Self::Arm),
            12 => Some(Self::Arm64),
            13 => Some(Self::Auto),
            _ => None,
        }
    }

    #[inline]
    pub fn to_id(&self) -> i32 {
        match self {
            ValueType::Byte => 0,
            ValueType::Word => 1,
            ValueType::Dword => 2,
            ValueType::Qword => 3,
            ValueType::Float => 4,
            ValueType::Double => 5,
            ValueType::Xor => 6,
            ValueType::Utf8 => 7,
            ValueType::Utf16LE => 8,
            ValueType::Hex => 9,
            ValueType::HexMixed => 10,
            ValueType::Arm => 11,
            ValueType::Arm64 => 12,
            ValueType::Auto => 13,
        }
    }

    /// Encoded width for types with a fixed representation. String and
    /// reserved types have no fixed width.
    #[inline]
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            ValueType::Byte => Some(1),
            ValueType::Word => Some(2),
            ValueType::Dword | ValueType::Float | ValueType::Xor => Some(4),
            ValueType::Qword | ValueType::Double => Some(8),
            _ => None,
        }
    }

    /// Step used by aligned (non-deep) scans. Strings step byte-wise.
    #[inline]
    pub fn natural_alignment(&self) -> usize {
        self.fixed_width().unwrap_or(1)
    }

    #[inline]
    pub fn is_float_type(&self) -> bool {
        matches!(self, ValueType::Float | ValueType::Double)
    }

    #[inline]
    pub fn is_string_type(&self) -> bool {
        matches!(self, ValueType::Utf8 | ValueType::Utf16LE)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Byte => write!(f, "Byte"),
            ValueType::Word => write!(f, "Word"),
            ValueType::Dword => write!(f, "Dword"),
            ValueType::Qword => write!(f, "Qword"),
            ValueType::Float => write!(f, "Float"),
            ValueType::Double => write!(f, "Double"),
            ValueType::Xor => write!(f, "Xor"),
            ValueType::Utf8 => write!(f, "Utf8"),
            ValueType::Utf16LE => write!(f, "Utf16LE"),
            ValueType::Hex => write!(f, "Hex"),
            ValueType::HexMixed => write!(f, "HexMixed"),
            ValueType::Arm => write!(f, "Arm"),
            ValueType::Arm64 => write!(f, "Arm64"),
            ValueType::Auto => write!(f, "Auto"),
        }
    }
}

/// Half-open address interval supplied by the client. The engine treats
/// ranges as opaque intervals; classification happens upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    #[inline]
    pub fn new(start: u64, end: u64) -> Self {
        MemoryRange { start, end }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.end > self.start
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a result entered the store: an exact pattern match or a recorded
/// slot from an unknown-value pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExactResultItem {
    pub native_position: u64,
    pub address: u64,
    pub value_type: ValueType,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuzzyResultItem {
    pub native_position: u64,
    pub address: u64,
    pub value_type: ValueType,
    pub value: Vec<u8>,
}

/// A stored match as handed back by result paging. The position is the
/// dense storage index for the current store generation; any removal or
/// retention call invalidates all previously fetched positions.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchResultItem {
    Exact(ExactResultItem),
    Fuzzy(FuzzyResultItem),
}

impl SearchResultItem {
    #[inline]
    pub fn native_position(&self) -> u64 {
        match self {
            SearchResultItem::Exact(item) => item.native_position,
            SearchResultItem::Fuzzy(item) => item.native_position,
        }
    }

    #[inline]
    pub fn address(&self) -> u64 {
        match self {
            SearchResultItem::Exact(item) => item.address,
            SearchResultItem::Fuzzy(item) => item.address,
        }
    }

    #[inline]
    pub fn value_type(&self) -> ValueType {
        match self {
            SearchResultItem::Exact(item) => item.value_type,
            SearchResultItem::Fuzzy(item) => item.value_type,
        }
    }

    #[inline]
    pub fn value_bytes(&self) -> &[u8] {
        match self {
            SearchResultItem::Exact(item) => &item.value,
            SearchResultItem::Fuzzy(item) => &item.value,
        }
    }

    /// Human-readable rendering of the stored snapshot.
    pub fn display_value(&self) -> String {
        super::codec::decode(self.value_bytes(), self.value_type())
    }
}

/// Comparison applied between a stored snapshot and the current memory
/// value during an unknown-value refine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FuzzyCondition {
    Unchanged,
    Changed,
    Increased,
    Decreased,
    IncreasedBy(i64),
    DecreasedBy(i64),
    IncreasedByRange(i64, i64),
    DecreasedByRange(i64, i64),
    /// New value exceeds old by the given fraction (0.1 means > old * 1.1).
    IncreasedByPercent(f32),
    DecreasedByPercent(f32),
}

impl FuzzyCondition {
    /// Boundary interchange form. Id 0 is reserved for the initial pass,
    /// which has its own entry point and no condition.
    pub fn from_id(id: i32, param1: i64, param2: i64) -> Option<Self> {
        match id {
            1 => Some(FuzzyCondition::Unchanged),
            2 => Some(FuzzyCondition::Changed),
            3 => Some(FuzzyCondition::Increased),
            4 => Some(FuzzyCondition::Decreased),
            5 => Some(FuzzyCondition::IncreasedBy(param1)),
            6 => Some(FuzzyCondition::DecreasedBy(param1)),
            7 => Some(FuzzyCondition::IncreasedByRange(param1, param2)),
            8 => Some(FuzzyCondition::DecreasedByRange(param1, param2)),
            9 => Some(FuzzyCondition::IncreasedByPercent(param1 as f32 / 100.0)),
            10 => Some(FuzzyCondition::DecreasedByPercent(param1 as f32 / 100.0)),
            _ => None,
        }
    }
}
