use anyhow::{Result, bail};

/// Validate a disk UUID in canonical 8-4-4-4-12 form and return it lowercased.
pub fn canonical_disk_uuid(uuid: &str) -> Result<String> {
    let groups: Vec<&str> = uuid.split('-').collect();
    let lengths: Vec<usize> = groups.iter().map(|g| g.len()).collect();
    if lengths != [8, 4, 4, 4, 12] || !groups.iter().all(|g| g.chars().all(|c| c.is_ascii_hexdigit()))
    {
        bail!("Disk UUID must be in 8-4-4-4-12 hex form: {:?}", uuid);
    }
    Ok(uuid.to_ascii_lowercase())
}

/// Validate a systemd unit name: `[a-zA-Z0-9@._\-\\]+`.
pub fn validate_unit_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-' | '\\'))
    {
        bail!("Unit name contains invalid characters: {:?}", name);
    }
    Ok(())
}

/// Validate a value written to a single systemd directive.
pub fn validate_unit_value(value: &str) -> Result<()> {
    if value.contains('\n') || value.contains('\r') {
        bail!("Unit value must not contain line breaks: {:?}", value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_disk_uuid_lowercases() {
        assert_eq!(
            canonical_disk_uuid("ABCDEFAB-CDEF-ABCD-ABCD-ABCDEFABCDEF").unwrap(),
            "abcdefab-cdef-abcd-abcd-abcdefabcdef"
        );
    }

    #[test]
    fn test_canonical_disk_uuid_rejects_other_forms() {
        for bad in [
            "invalid",
            "",
            "12345678123412341234123456789012",
            "12345678-1234-1234-1234-1234567890123",
            "g2345678-1234-1234-1234-123456789012",
            "{12345678-1234-1234-1234-123456789012}",
        ] {
            assert!(canonical_disk_uuid(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_unit_names() {
        assert!(validate_unit_name("bootstrapper").is_ok());
        assert!(validate_unit_name("getty@tty1.service").is_ok());
        assert!(validate_unit_name("a\\x2db").is_ok());
        assert!(validate_unit_name("bad name").is_err());
        assert!(validate_unit_name("x;rm").is_err());
        assert!(validate_unit_name("").is_err());
    }

    #[test]
    fn test_unit_value_rejects_newlines() {
        assert!(validate_unit_value("/opt/bootstrapper --flag").is_ok());
        assert!(validate_unit_value("/opt/x\nExecStartPre=/bin/sh").is_err());
        assert!(validate_unit_value("/opt/x\r").is_err());
    }
}
