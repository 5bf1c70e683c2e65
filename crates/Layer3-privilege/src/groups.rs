//! Group assignment from per-actor allowed template sets

use crate::schema::SUPER_GROUP_ID;
use dbguard_foundation::{GroupListPolicyRecord, GroupRecord};
use std::collections::{BTreeSet, HashSet};

/// Memberships derived for one actor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    /// Matched Group-List Policy ids
    pub policies: BTreeSet<i64>,
    /// Matched group ids
    pub groups: BTreeSet<i64>,
}

/// Super actors land in the reserved group only. Everyone else gets every
/// Group-List Policy whose template set is covered by `allowed`, then every
/// group whose required policies are all matched.
///
/// Empty template sets and empty requirement lists never match.
pub fn assign_groups(
    is_super: bool,
    allowed: &HashSet<i64>,
    group_list_policies: &[GroupListPolicyRecord],
    groups: &[GroupRecord],
) -> Assignment {
    if is_super {
        return Assignment {
            policies: BTreeSet::new(),
            groups: BTreeSet::from([SUPER_GROUP_ID]),
        };
    }

    let policies: BTreeSet<i64> = group_list_policies
        .iter()
        .filter(|glp| {
            !glp.template_ids.is_empty() && glp.template_ids.iter().all(|t| allowed.contains(t))
        })
        .map(|glp| glp.id)
        .collect();

    let groups = groups
        .iter()
        .filter(|g| g.id != SUPER_GROUP_ID)
        .filter(|g| {
            !g.required_policy_ids.is_empty()
                && g.required_policy_ids.iter().all(|p| policies.contains(p))
        })
        .map(|g| g.id)
        .collect();

    Assignment { policies, groups }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glp(id: i64, templates: &[i64]) -> GroupListPolicyRecord {
        GroupListPolicyRecord {
            id,
            name: format!("glp-{}", id),
            template_ids: templates.to_vec(),
        }
    }

    fn group(id: i64, policies: &[i64]) -> GroupRecord {
        GroupRecord {
            id,
            name: format!("group-{}", id),
            required_policy_ids: policies.to_vec(),
        }
    }

    #[test]
    fn test_super_short_circuit() {
        let allowed = HashSet::from([1, 5, 6]);
        let assignment = assign_groups(true, &allowed, &[glp(10, &[5])], &[group(2, &[10])]);
        assert!(assignment.policies.is_empty());
        assert_eq!(assignment.groups, BTreeSet::from([SUPER_GROUP_ID]));
    }

    #[test]
    fn test_superset_law() {
        let glps = vec![glp(10, &[5, 6]), glp(11, &[7]), glp(12, &[])];
        let groups = vec![group(2, &[10]), group(3, &[10, 11]), group(4, &[])];

        let assignment = assign_groups(false, &HashSet::from([5, 6, 9]), &glps, &groups);
        assert_eq!(assignment.policies, BTreeSet::from([10]));
        assert_eq!(assignment.groups, BTreeSet::from([2]));

        let assignment = assign_groups(false, &HashSet::from([5, 6, 7]), &glps, &groups);
        assert_eq!(assignment.policies, BTreeSet::from([10, 11]));
        assert_eq!(assignment.groups, BTreeSet::from([2, 3]));

        let assignment = assign_groups(false, &HashSet::from([5]), &glps, &groups);
        assert_eq!(assignment, Assignment::default());
    }

    #[test]
    fn test_reserved_group_never_assigned_to_regular_actors() {
        let glps = vec![glp(10, &[5])];
        let groups = vec![group(SUPER_GROUP_ID, &[10])];
        let assignment = assign_groups(false, &HashSet::from([5]), &glps, &groups);
        assert!(assignment.groups.is_empty());
    }
}
