//! Association descriptors and foreign-key / join-table naming.
//!
//! A descriptor records what was declared on one association member. The
//! physical names (foreign-key column, join table and its columns) depend on
//! the target type's metadata, which may in turn refer back to the owner, so
//! they are resolved on first use and cached in the descriptor.

use std::sync::OnceLock;

use relmodel_core::{Error, Result};
use serde::Serialize;

use crate::metadata::EntityInfo;

/// The kind of relationship an association member declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AssociationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// Operations propagated from an owner to its associated entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Cascade {
    Persist,
    Remove,
    /// Shorthand for every cascade.
    All,
}

/// When associated entities are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Fetch {
    /// Loaded together with the owner.
    Eager,
    /// Loaded on first access.
    Lazy,
}

/// Explicit many-to-many join table naming. Unset parts fall back to the
/// derived defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinTable {
    pub name: Option<String>,
    /// Column referencing the declaring (owner) side.
    pub join_column: Option<String>,
    /// Column referencing the target side.
    pub inverse_join_column: Option<String>,
}

impl JoinTable {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn join_column(mut self, column: impl Into<String>) -> Self {
        self.join_column = Some(column.into());
        self
    }

    pub fn inverse_join_column(mut self, column: impl Into<String>) -> Self {
        self.inverse_join_column = Some(column.into());
        self
    }
}

/// Physical names an association reads and writes through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ResolvedNames {
    /// A foreign-key column, in the owner's table for owning to-one members
    /// and in the target's table otherwise.
    ForeignKey(String),
    JoinTable {
        table: String,
        owner_column: String,
        target_column: String,
    },
}

/// Declared metadata of one association member.
#[derive(Debug, Serialize)]
pub struct AssociationDescriptor {
    /// Member name on the declaring type.
    pub member: String,
    pub kind: AssociationKind,
    /// Simple name of the associated type.
    pub target: &'static str,
    /// Name of the reciprocal member on the target when this is the
    /// inverse side.
    pub mapped_by: Option<String>,
    pub join_column: Option<String>,
    pub join_table: Option<JoinTable>,
    pub cascade: Vec<Cascade>,
    pub fetch: Fetch,
    pub orphan_removal: bool,
    #[serde(skip)]
    pub(crate) resolved: OnceLock<ResolvedNames>,
}

impl AssociationDescriptor {
    /// The owning side stores the link; an inverse side names its
    /// reciprocal through `mapped_by`.
    pub fn is_owning(&self) -> bool {
        self.mapped_by.is_none()
    }

    /// True when the foreign key lives in the declaring type's own row.
    pub fn is_parent_side(&self) -> bool {
        match self.kind {
            AssociationKind::ManyToOne => true,
            AssociationKind::OneToOne => self.is_owning(),
            AssociationKind::OneToMany | AssociationKind::ManyToMany => false,
        }
    }

    /// True for members that hold dependents: collections and the inverse
    /// side of a one-to-one.
    pub fn is_child_side(&self) -> bool {
        !self.is_parent_side()
    }

    pub fn cascades_persist(&self) -> bool {
        self.cascade
            .iter()
            .any(|c| matches!(c, Cascade::Persist | Cascade::All))
    }

    pub fn cascades_remove(&self) -> bool {
        self.cascade
            .iter()
            .any(|c| matches!(c, Cascade::Remove | Cascade::All))
    }

    /// Resolved names, if they have been computed already.
    pub fn resolved(&self) -> Option<&ResolvedNames> {
        self.resolved.get()
    }
}

fn reciprocal<'a>(
    desc: &AssociationDescriptor,
    mapped_by: &str,
    owner: &EntityInfo,
    target: &'a EntityInfo,
) -> Result<&'a AssociationDescriptor> {
    target
        .associations
        .iter()
        .map(AsRef::as_ref)
        .find(|a| a.member == mapped_by)
        .ok_or_else(|| {
            Error::entity(format!(
                "{}.{} is mapped by {}.{}, which is not an association member",
                owner.type_name, desc.member, target.type_name, mapped_by
            ))
        })
}

/// Compute the physical names for `desc`, declared on `owner` and pointing
/// at `target`.
///
/// Foreign keys: an explicit join column wins; an inverse member uses the
/// reciprocal's join column or `<owner table>_id`; a one-to-many uses
/// `<owner table>_id`; an owning to-one uses `<target table>_id`.
///
/// Join tables: explicit names win; an inverse member mirrors the
/// reciprocal's join table with the columns swapped; otherwise
/// `<owner>_<target>` with `<table>_id` columns.
pub fn resolve_names(
    desc: &AssociationDescriptor,
    owner: &EntityInfo,
    target: &EntityInfo,
) -> Result<ResolvedNames> {
    let owner_key = format!("{}_id", owner.table);
    let target_key = format!("{}_id", target.table);

    if desc.kind == AssociationKind::ManyToMany {
        if let Some(jt) = &desc.join_table {
            return Ok(ResolvedNames::JoinTable {
                table: jt
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}_{}", owner.table, target.table)),
                owner_column: jt.join_column.clone().unwrap_or(owner_key),
                target_column: jt.inverse_join_column.clone().unwrap_or(target_key),
            });
        }
        if let Some(mapped_by) = &desc.mapped_by {
            let other = reciprocal(desc, mapped_by, owner, target)?;
            let jt = other.join_table.clone().unwrap_or_default();
            return Ok(ResolvedNames::JoinTable {
                table: jt
                    .name
                    .unwrap_or_else(|| format!("{}_{}", target.table, owner.table)),
                owner_column: jt.inverse_join_column.unwrap_or(owner_key),
                target_column: jt.join_column.unwrap_or(target_key),
            });
        }
        return Ok(ResolvedNames::JoinTable {
            table: format!("{}_{}", owner.table, target.table),
            owner_column: owner_key,
            target_column: target_key,
        });
    }

    if let Some(column) = &desc.join_column {
        return Ok(ResolvedNames::ForeignKey(column.clone()));
    }
    if let Some(mapped_by) = &desc.mapped_by {
        let other = reciprocal(desc, mapped_by, owner, target)?;
        return Ok(ResolvedNames::ForeignKey(
            other.join_column.clone().unwrap_or(owner_key),
        ));
    }
    if desc.kind == AssociationKind::OneToMany {
        return Ok(ResolvedNames::ForeignKey(owner_key));
    }
    Ok(ResolvedNames::ForeignKey(target_key))
}

#[cfg(test)]
pub(crate) fn descriptor(member: &str, kind: AssociationKind) -> AssociationDescriptor {
    AssociationDescriptor {
        member: member.to_string(),
        kind,
        target: "Target",
        mapped_by: None,
        join_column: None,
        join_table: None,
        cascade: Vec::new(),
        fetch: Fetch::Lazy,
        orphan_removal: false,
        resolved: OnceLock::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn info(type_name: &'static str, table: &str, assocs: Vec<AssociationDescriptor>) -> EntityInfo {
        EntityInfo {
            type_name,
            table: table.to_string(),
            id_column: Some("id".to_string()),
            auto_generated: true,
            columns: Vec::new(),
            embedded: Vec::new(),
            discriminator: None,
            extends: None,
            associations: assocs.into_iter().map(Arc::new).collect(),
        }
    }

    #[test]
    fn test_owning_to_one_uses_target_table() {
        let desc = descriptor("owner", AssociationKind::ManyToOne);
        let names = resolve_names(&desc, &info("Phone", "phone", vec![]), &info("User", "user", vec![]));
        assert_eq!(names.unwrap(), ResolvedNames::ForeignKey("user_id".into()));
    }

    #[test]
    fn test_explicit_join_column_wins() {
        let mut desc = descriptor("owner", AssociationKind::ManyToOne);
        desc.join_column = Some("owned_by".into());
        let names = resolve_names(&desc, &info("Phone", "phone", vec![]), &info("User", "user", vec![]));
        assert_eq!(names.unwrap(), ResolvedNames::ForeignKey("owned_by".into()));
    }

    #[test]
    fn test_unidirectional_one_to_many_uses_owner_table() {
        let desc = descriptor("phones", AssociationKind::OneToMany);
        let names = resolve_names(&desc, &info("User", "user", vec![]), &info("Phone", "phone", vec![]));
        assert_eq!(names.unwrap(), ResolvedNames::ForeignKey("user_id".into()));
    }

    #[test]
    fn test_mapped_by_follows_reciprocal_join_column() {
        let mut back = descriptor("owner", AssociationKind::ManyToOne);
        back.join_column = Some("owned_by".into());
        let phone = info("Phone", "phone", vec![back]);

        let mut desc = descriptor("phones", AssociationKind::OneToMany);
        desc.mapped_by = Some("owner".into());
        let names = resolve_names(&desc, &info("User", "user", vec![]), &phone).unwrap();
        assert_eq!(names, ResolvedNames::ForeignKey("owned_by".into()));
    }

    #[test]
    fn test_mapped_by_without_join_column_matches_owning_default() {
        let phone = info("Phone", "phone", vec![descriptor("owner", AssociationKind::ManyToOne)]);
        let mut desc = descriptor("phones", AssociationKind::OneToMany);
        desc.mapped_by = Some("owner".into());
        let names = resolve_names(&desc, &info("User", "user", vec![]), &phone).unwrap();
        assert_eq!(names, ResolvedNames::ForeignKey("user_id".into()));
    }

    #[test]
    fn test_mapped_by_unknown_member_is_error() {
        let mut desc = descriptor("phones", AssociationKind::OneToMany);
        desc.mapped_by = Some("nobody".into());
        let err = resolve_names(&desc, &info("User", "user", vec![]), &info("Phone", "phone", vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::Entity(_)));
        assert!(err.to_string().contains("Phone.nobody"));
    }

    #[test]
    fn test_many_to_many_defaults() {
        let desc = descriptor("roles", AssociationKind::ManyToMany);
        let names = resolve_names(&desc, &info("User", "user", vec![]), &info("Role", "role", vec![]));
        assert_eq!(
            names.unwrap(),
            ResolvedNames::JoinTable {
                table: "user_role".into(),
                owner_column: "user_id".into(),
                target_column: "role_id".into(),
            }
        );
    }

    #[test]
    fn test_many_to_many_inverse_swaps_reciprocal_columns() {
        let mut owning = descriptor("roles", AssociationKind::ManyToMany);
        owning.join_table = Some(JoinTable::named("grants").join_column("uid").inverse_join_column("rid"));
        let user = info("User", "user", vec![owning]);

        let mut inverse = descriptor("users", AssociationKind::ManyToMany);
        inverse.mapped_by = Some("roles".into());
        let names = resolve_names(&inverse, &info("Role", "role", vec![]), &user).unwrap();
        assert_eq!(
            names,
            ResolvedNames::JoinTable {
                table: "grants".into(),
                owner_column: "rid".into(),
                target_column: "uid".into(),
            }
        );
    }

    #[test]
    fn test_many_to_many_inverse_default_table_is_reversed() {
        let user = info("User", "user", vec![descriptor("roles", AssociationKind::ManyToMany)]);
        let mut inverse = descriptor("users", AssociationKind::ManyToMany);
        inverse.mapped_by = Some("roles".into());
        let names = resolve_names(&inverse, &info("Role", "role", vec![]), &user).unwrap();
        assert_eq!(
            names,
            ResolvedNames::JoinTable {
                table: "user_role".into(),
                owner_column: "role_id".into(),
                target_column: "user_id".into(),
            }
        );
    }

    #[test]
    fn test_sides() {
        let mut one = descriptor("profile", AssociationKind::OneToOne);
        assert!(one.is_parent_side());
        one.mapped_by = Some("user".into());
        assert!(one.is_child_side());
        assert!(descriptor("phones", AssociationKind::OneToMany).is_child_side());
    }

    #[test]
    fn test_cascade_all_implies_both() {
        let mut desc = descriptor("phones", AssociationKind::OneToMany);
        assert!(!desc.cascades_persist());
        desc.cascade = vec![Cascade::All];
        assert!(desc.cascades_persist());
        assert!(desc.cascades_remove());
    }
}
