//! Template classification into evaluation tiers

use crate::schema::DbFamily;
use crate::template::ProbeTemplate;
use dbguard_foundation::{GroupListPolicyRecord, TemplateRecord};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Evaluation tier, run in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Reserved super-privilege template
    Super,
    /// Templates that belong to some Group-List Policy
    ActionWide,
    /// Everything else
    ObjectSpecific,
}

impl Tier {
    pub const ORDER: [Tier; 3] = [Tier::Super, Tier::ActionWide, Tier::ObjectSpecific];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Super => "super",
            Tier::ActionWide => "action_wide",
            Tier::ObjectSpecific => "object_specific",
        }
    }
}

/// Templates partitioned by tier
#[derive(Debug, Clone, Default)]
pub struct ClassifiedTemplates {
    pub super_tier: Vec<ProbeTemplate>,
    pub action_tier: Vec<ProbeTemplate>,
    pub object_tier: Vec<ProbeTemplate>,
    /// Templates dropped because they could not be decoded
    pub rejected: Vec<i64>,
}

impl ClassifiedTemplates {
    pub fn tier(&self, tier: Tier) -> &[ProbeTemplate] {
        match tier {
            Tier::Super => &self.super_tier,
            Tier::ActionWide => &self.action_tier,
            Tier::ObjectSpecific => &self.object_tier,
        }
    }

    pub fn len(&self) -> usize {
        self.super_tier.len() + self.action_tier.len() + self.object_tier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Partition the stored catalog for one family
pub fn classify(
    family: DbFamily,
    records: &[TemplateRecord],
    group_list_policies: &[GroupListPolicyRecord],
) -> ClassifiedTemplates {
    let action_wide: HashSet<i64> = group_list_policies
        .iter()
        .flat_map(|glp| glp.template_ids.iter().copied())
        .collect();

    let mut classified = ClassifiedTemplates::default();
    for record in records {
        // family 문자열이 다르면 decode 전에 걸러낸다
        if !record
            .family
            .parse::<DbFamily>()
            .is_ok_and(|f| f == family)
        {
            continue;
        }

        let template = match ProbeTemplate::decode(record) {
            Ok(t) => t,
            Err(e) => {
                warn!("Skipping template: {}", e);
                classified.rejected.push(record.id);
                continue;
            }
        };

        let references = family.references_catalog(&template.definition.query)
            || template
                .definition
                .object_query
                .as_deref()
                .is_some_and(|q| family.references_catalog(q));
        if !references {
            debug!(template_id = template.id, "Template does not reference the mirrored catalog");
            continue;
        }

        if template.is_super() {
            classified.super_tier.push(template);
        } else if action_wide.contains(&template.id) {
            classified.action_tier.push(template);
        } else {
            classified.object_tier.push(template);
        }
    }

    debug!(
        "Classified {} templates: super={}, action={}, object={}",
        classified.len(),
        classified.super_tier.len(),
        classified.action_tier.len(),
        classified.object_tier.len()
    );
    classified
}
