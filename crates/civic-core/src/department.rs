//! Canonical assignee-prefix to department table.

/// Raw assignee-name prefix (text before the first `_`) to department.
pub const DEPARTMENTS: &[(&str, &str)] = &[
    ("NCS", "Neighborhood and Community Services"),
    ("TPD", "Tacoma Police Department"),
    ("Police Department - Traffic - JN", "Tacoma Police Department"),
    ("Police Department - Traffic - HM", "Tacoma Police Department"),
    ("ES", "Environmental Services"),
    ("PW", "Public Works"),
    ("311 Customer Support Center", "311 Support"),
    ("PDS Code Case", "Planning and Development Services"),
    ("T&L", "Public Works"),
    ("CMO", "City Manager's Office"),
    ("PDS", "Planning and Development Services"),
    ("OEHR", "Office of Equity and Human Rights"),
    ("Public Works - D.S.", "Public Works"),
    ("Public Works - Streets - TD", "Public Works"),
    ("Public Works - Traffic - JK", "Public Works"),
    ("Public Works - Streets - NG", "Public Works"),
    ("Fire", "Tacoma Fire Department"),
    ("PPW Water Quality Specialist - Davidson", "Public Works"),
    ("PPW – Asst Airport Administrator - Propst", "Public Works"),
    ("PPW Water Quality Specialist - Thompson", "Public Works"),
    ("IT", "Information Technology"),
    ("TPU", "Tacoma Public Utilities"),
    ("TVE", "Tacoma Venues & Events"),
    ("CED", "Community & Economic Development"),
];

/// Department owning an assignee, keyed on the text before the first `_`.
pub fn department_for_assignee(assignee_name: &str) -> Option<&'static str> {
    let prefix = assignee_name.split('_').next().unwrap_or_default();
    DEPARTMENTS
        .iter()
        .find(|(raw, _)| *raw == prefix)
        .map(|(_, department)| *department)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_prefix_before_underscore() {
        assert_eq!(department_for_assignee("NCS_Litter"), Some("Neighborhood and Community Services"));
        assert_eq!(department_for_assignee("TPD"), Some("Tacoma Police Department"));
        assert_eq!(
            department_for_assignee("Public Works - Streets - TD_North"),
            Some("Public Works")
        );
    }

    #[test]
    fn unknown_prefix_is_unmapped() {
        assert_eq!(department_for_assignee("Parks_Crew"), None);
        assert_eq!(department_for_assignee(""), None);
    }

    #[test]
    fn table_has_no_duplicate_prefixes() {
        for (i, (a, _)) in DEPARTMENTS.iter().enumerate() {
            assert!(DEPARTMENTS[i + 1..].iter().all(|(b, _)| a != b), "duplicate prefix {a}");
        }
    }
}
