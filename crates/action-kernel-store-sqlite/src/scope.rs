use action_kernel_core::ActionSelector;
use rusqlite::types::Value;

/// SQL predicate over `action_records` for the union of a set of selectors.
///
/// Placeholders are numbered from `first_param`, so the clause can appear more than once in a
/// statement while binding its values only once.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SelectorFilter {
    pub(crate) clause: String,
    pub(crate) values: Vec<Value>,
}

impl SelectorFilter {
    /// `None` when there is nothing to match; an empty selector list selects no record.
    pub(crate) fn build(selectors: &[ActionSelector], first_param: usize) -> Option<Self> {
        if selectors.is_empty() {
            return None;
        }

        let mut terms = Vec::with_capacity(selectors.len());
        let mut values = Vec::new();
        let mut next = first_param;

        for selector in selectors {
            let scope_param = next;
            values.push(Value::Text(selector.scope.path()));
            next += 1;

            match selector.kind {
                Some(kind) => {
                    values.push(Value::Text(kind.as_str().to_string()));
                    terms.push(format!("(scope = ?{scope_param} AND kind = ?{next})"));
                    next += 1;
                }
                None => terms.push(format!("scope = ?{scope_param}")),
            }
        }

        Some(Self { clause: format!("({})", terms.join(" OR ")), values })
    }
}

#[cfg(test)]
mod tests {
    use action_kernel_core::{ActionKind, ActionScope, TableId, WorkspaceId};

    use super::*;

    #[test]
    fn empty_selectors_build_no_filter() {
        assert_eq!(SelectorFilter::build(&[], 2), None);
    }

    #[test]
    fn selectors_are_or_joined_with_numbered_placeholders() {
        let selectors = [
            ActionSelector::of_kind(ActionKind::UpdateField, ActionScope::Table(TableId(4))),
            ActionSelector::any_kind(ActionScope::Workspace(WorkspaceId(1))),
        ];
        let Some(filter) = SelectorFilter::build(&selectors, 2) else {
            panic!("non-empty selectors must build a filter");
        };
        assert_eq!(filter.clause, "((scope = ?2 AND kind = ?3) OR scope = ?4)");
        assert_eq!(
            filter.values,
            vec![
                Value::Text("table:4".to_string()),
                Value::Text("update_field".to_string()),
                Value::Text("workspace:1".to_string()),
            ]
        );
    }
}
