//! Table migration specs: the fixed, hand-mapped column set per table.

use serde::Serialize;

/// Semantic type of a mapped column.
///
/// Drivers pick the wire encoding from this; the checker picks the
/// comparison rule from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "references")]
pub enum ColumnType {
    /// Free text (`VARCHAR`).
    Text,
    /// 64-bit integer.
    Integer,
    /// Double precision amount.
    Float,
    Boolean,
    /// Calendar date without time.
    Date,
    /// Timestamp without timezone.
    Timestamp,
    /// Enum persisted as its string name (`EXPENSE`, `MONTHLY`, ...).
    Enum,
    /// Reference to the `id` of another table.
    ForeignKey(&'static str),
}

impl ColumnType {
    /// Referenced table, if this is a foreign key.
    pub fn references(&self) -> Option<&'static str> {
        match self {
            ColumnType::ForeignKey(table) => Some(table),
            _ => None,
        }
    }
}

/// One mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ColumnSpec {
    /// Column name, identical in both stores.
    pub name: &'static str,
    /// Semantic type.
    pub ty: ColumnType,
    /// Whether NULL is allowed.
    pub nullable: bool,
}

impl ColumnSpec {
    pub const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
        }
    }

    pub const fn optional(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
        }
    }
}

/// Migration description of one table.
///
/// `columns` is the exact column list copied and compared, in order.
/// The surrogate `id` is never part of it: primary ids are not stable across
/// stores, so rows are correlated by `natural_key` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TableMigrationSpec {
    /// Table name, identical in both stores.
    pub name: &'static str,
    /// Mapped columns in copy order.
    pub columns: &'static [ColumnSpec],
    /// Tables that must be present before this one is copied.
    pub depends_on: &'static [&'static str],
    /// Columns that identify a row across stores.
    pub natural_key: &'static [&'static str],
}

impl TableMigrationSpec {
    /// Position of a column in [`columns`](Self::columns).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Column names in copy order.
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }

    /// Positions of the natural key columns.
    ///
    /// Catalog validation guarantees every natural key column exists.
    pub fn natural_key_indices(&self) -> Vec<usize> {
        self.natural_key
            .iter()
            .filter_map(|k| self.column_index(k))
            .collect()
    }

    /// Foreign key columns as `(position, column, referenced table)`.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (usize, &'static ColumnSpec, &'static str)> {
        self.columns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.ty.references().map(|t| (i, c, t)))
    }

    /// Whether the table references any other table.
    pub fn has_dependencies(&self) -> bool {
        !self.depends_on.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARENT_COLUMNS: &[ColumnSpec] = &[ColumnSpec::required("name", ColumnType::Text)];
    const CHILD_COLUMNS: &[ColumnSpec] = &[
        ColumnSpec::required("label", ColumnType::Text),
        ColumnSpec::optional("note", ColumnType::Text),
        ColumnSpec::required("parent_id", ColumnType::ForeignKey("parents")),
    ];

    const CHILD: TableMigrationSpec = TableMigrationSpec {
        name: "children",
        columns: CHILD_COLUMNS,
        depends_on: &["parents"],
        natural_key: &["parent_id", "label"],
    };

    #[test]
    fn test_column_lookup() {
        assert_eq!(CHILD.column_index("note"), Some(1));
        assert_eq!(CHILD.column_index("id"), None);
        assert_eq!(CHILD.column_names(), vec!["label", "note", "parent_id"]);
        assert_eq!(PARENT_COLUMNS.len(), 1);
    }

    #[test]
    fn test_natural_key_indices_follow_key_order() {
        assert_eq!(CHILD.natural_key_indices(), vec![2, 0]);
    }

    #[test]
    fn test_foreign_keys() {
        let fks: Vec<_> = CHILD.foreign_keys().map(|(i, c, t)| (i, c.name, t)).collect();
        assert_eq!(fks, vec![(2, "parent_id", "parents")]);
        assert!(CHILD.has_dependencies());
    }
}
