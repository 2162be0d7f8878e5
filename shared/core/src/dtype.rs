//! The scalar dtype lattice: a small, static type system for the value
//! kinds the distance engine and parameter codec move around.
//!
//! Ported from `heat`'s `core/types.py` can-cast / same-kind / promotion
//! tables. The dynamic half of that module (inferring a `ScalarKind` from an
//! arbitrary Python object) has no counterpart here — every caller in this
//! crate already knows its dtype statically, so only the static lattice is
//! carried over.

use std::cmp::Ordering;

/// The scalar kinds the codec and distance engine are willing to carry.
///
/// Ordered from narrowest to widest within each family; `rank` below defines
/// the total casting order used by [`ScalarKind::can_cast`] and
/// [`ScalarKind::promote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float16,
    Bfloat16,
    Float32,
    Float64,
}

/// The broad family a [`ScalarKind`] belongs to, used for the `same_kind`
/// casting rule (same family casts are always considered safe regardless of
/// width, matching numpy/heat's `same_kind` semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Bool,
    SignedInt,
    UnsignedInt,
    Float,
}

impl ScalarKind {
    pub fn family(self) -> Family {
        use ScalarKind::*;
        match self {
            Bool => Family::Bool,
            Int8 | Int16 | Int32 | Int64 => Family::SignedInt,
            Uint8 | Uint16 | Uint32 | Uint64 => Family::UnsignedInt,
            Float16 | Bfloat16 | Float32 | Float64 => Family::Float,
        }
    }

    /// Width in bits, used to break ties between same-family kinds and to
    /// decide when a signed/unsigned mix must promote out of both families.
    pub fn bits(self) -> u32 {
        use ScalarKind::*;
        match self {
            Bool => 1,
            Int8 | Uint8 => 8,
            Int16 | Uint16 | Float16 | Bfloat16 => 16,
            Int32 | Uint32 | Float32 => 32,
            Int64 | Uint64 | Float64 => 64,
        }
    }

    /// Total order used for "safe" casting: every value representable in
    /// `self` is representable in any kind with a strictly greater rank, and
    /// bool casts safely into everything. This mirrors `heat`'s can_cast
    /// table without reproducing its full pairwise matrix: the table is
    /// exactly this linear order for the subset of dtypes this crate deals
    /// in.
    fn rank(self) -> u32 {
        use ScalarKind::*;
        match self {
            Bool => 0,
            Int8 => 1,
            Uint8 => 2,
            Int16 => 3,
            Uint16 => 4,
            Int32 => 5,
            Uint32 => 6,
            Int64 => 7,
            Uint64 => 8,
            Float16 => 9,
            Bfloat16 => 9,
            Float32 => 10,
            Float64 => 11,
        }
    }

    /// Whether a value of kind `self` can be cast to `target` without loss
    /// of information, per the rank order above. Every kind can cast to
    /// itself.
    pub fn can_cast(self, target: ScalarKind) -> bool {
        self == target || self.rank() <= target.rank()
    }

    /// `heat`'s `same_kind` casting rule: a cast is allowed if both kinds
    /// share a [`Family`], regardless of width (narrowing within a family is
    /// considered acceptable, unlike [`ScalarKind::can_cast`]).
    pub fn same_kind(self, other: ScalarKind) -> bool {
        self.family() == other.family()
    }

    /// The promoted kind two values must share before an elementwise
    /// operation (e.g. the blend step of the parameter codec) can combine
    /// them. Ties within a family resolve to the wider kind; mixing across
    /// families resolves to the kind that can safely hold both, per rank.
    pub fn promote(self, other: ScalarKind) -> ScalarKind {
        if self == other {
            return self;
        }
        match self.rank().cmp(&other.rank()) {
            Ordering::Less => other,
            Ordering::Greater => self,
            Ordering::Equal => {
                // Only Float16/Bfloat16 share a rank; neither safely holds
                // the other's subnormal range, so promote to Float32.
                ScalarKind::Float32
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_casts_to_itself() {
        let kinds = [
            ScalarKind::Bool,
            ScalarKind::Int8,
            ScalarKind::Uint8,
            ScalarKind::Int16,
            ScalarKind::Uint16,
            ScalarKind::Int32,
            ScalarKind::Uint32,
            ScalarKind::Int64,
            ScalarKind::Uint64,
            ScalarKind::Float16,
            ScalarKind::Bfloat16,
            ScalarKind::Float32,
            ScalarKind::Float64,
        ];
        for k in kinds {
            assert!(k.can_cast(k));
        }
    }

    #[test]
    fn bool_casts_into_everything() {
        assert!(ScalarKind::Bool.can_cast(ScalarKind::Int8));
        assert!(ScalarKind::Bool.can_cast(ScalarKind::Float64));
    }

    #[test]
    fn narrowing_cast_is_rejected() {
        assert!(!ScalarKind::Float64.can_cast(ScalarKind::Float32));
        assert!(!ScalarKind::Int32.can_cast(ScalarKind::Int16));
    }

    #[test]
    fn same_kind_allows_narrowing_within_a_family() {
        assert!(ScalarKind::Int32.same_kind(ScalarKind::Int16));
        assert!(!ScalarKind::Int32.same_kind(ScalarKind::Uint32));
        assert!(!ScalarKind::Int32.same_kind(ScalarKind::Float32));
    }

    #[test]
    fn promote_picks_the_wider_same_family_kind() {
        assert_eq!(
            ScalarKind::Int16.promote(ScalarKind::Int64),
            ScalarKind::Int64
        );
    }

    #[test]
    fn promote_breaks_half_precision_tie_into_float32() {
        assert_eq!(
            ScalarKind::Float16.promote(ScalarKind::Bfloat16),
            ScalarKind::Float32
        );
    }
}
