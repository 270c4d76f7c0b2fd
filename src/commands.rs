//! Version-aware replication command builders (spec §4.D).

use crate::error::Error;
use crate::lsn::Lsn;
use crate::version::ServerVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotAction {
    Export,
    Use,
    Nothing,
}

#[derive(Debug, Clone, Default)]
pub struct CreateLogicalSlotOptions {
    pub temporary: bool,
    pub snapshot_action: Option<SnapshotAction>,
    pub two_phase: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CreatePhysicalSlotOptions {
    pub temporary: bool,
    pub reserve_wal: bool,
}

fn check_temporary(temporary: bool, server: &ServerVersion) -> Result<(), Error> {
    if temporary && !server.at_least(10, 0) {
        return Err(Error::Unsupported {
            feature: "TEMPORARY",
            min_version: "10",
            actual_version: format!("{}", server.major),
        });
    }
    Ok(())
}

pub fn identify_system() -> String {
    "IDENTIFY_SYSTEM".to_string()
}

pub fn show(param: &str) -> String {
    format!("SHOW {param}")
}

pub fn timeline_history(tli: i32) -> String {
    format!("TIMELINE_HISTORY {tli}")
}

pub fn create_replication_slot_physical(
    name: &str,
    options: &CreatePhysicalSlotOptions,
    server: &ServerVersion,
) -> Result<String, Error> {
    check_temporary(options.temporary, server)?;

    let temp = if options.temporary { " TEMPORARY" } else { "" };
    if server.at_least(15, 0) {
        let reserve = if options.reserve_wal { " (RESERVE_WAL)" } else { "" };
        Ok(format!("CREATE_REPLICATION_SLOT {name}{temp} PHYSICAL{reserve}"))
    } else {
        let reserve = if options.reserve_wal { " RESERVE_WAL" } else { "" };
        Ok(format!("CREATE_REPLICATION_SLOT {name}{temp} PHYSICAL{reserve}"))
    }
}

pub fn create_replication_slot_logical(
    name: &str,
    plugin: &str,
    options: &CreateLogicalSlotOptions,
    server: &ServerVersion,
) -> Result<String, Error> {
    check_temporary(options.temporary, server)?;

    if options.snapshot_action.is_some() && !server.at_least(10, 0) {
        return Err(Error::Unsupported {
            feature: "SNAPSHOT",
            min_version: "10",
            actual_version: format!("{}", server.major),
        });
    }
    if options.two_phase && !server.at_least(15, 0) {
        return Err(Error::Unsupported {
            feature: "TWO_PHASE",
            min_version: "15",
            actual_version: format!("{}", server.major),
        });
    }

    let temp = if options.temporary { " TEMPORARY" } else { "" };

    if server.at_least(15, 0) {
        let mut parts = Vec::new();
        if let Some(action) = options.snapshot_action {
            let value = match action {
                SnapshotAction::Export => "export",
                SnapshotAction::Use => "use",
                SnapshotAction::Nothing => "nothing",
            };
            parts.push(format!("SNAPSHOT '{value}'"));
        }
        if options.two_phase {
            parts.push("TWO_PHASE".to_string());
        }
        let opts = if parts.is_empty() {
            String::new()
        } else {
            format!(" ({})", parts.join(", "))
        };
        Ok(format!(
            "CREATE_REPLICATION_SLOT {name}{temp} LOGICAL {plugin}{opts}"
        ))
    } else {
        let mut suffix = String::new();
        match options.snapshot_action {
            Some(SnapshotAction::Export) => suffix.push_str(" EXPORT_SNAPSHOT"),
            Some(SnapshotAction::Use) => suffix.push_str(" USE_SNAPSHOT"),
            Some(SnapshotAction::Nothing) => suffix.push_str(" NOEXPORT_SNAPSHOT"),
            None => {}
        }
        if options.two_phase {
            suffix.push_str(" TWO_PHASE");
        }
        Ok(format!(
            "CREATE_REPLICATION_SLOT {name}{temp} LOGICAL {plugin}{suffix}"
        ))
    }
}

pub fn drop_replication_slot(name: &str, wait: bool) -> String {
    if wait {
        format!("DROP_REPLICATION_SLOT {name} WAIT")
    } else {
        format!("DROP_REPLICATION_SLOT {name}")
    }
}

pub fn start_replication_physical(slot: Option<&str>, lsn: Lsn, timeline: Option<i32>) -> String {
    let mut cmd = String::from("START_REPLICATION");
    if let Some(slot) = slot {
        cmd.push_str(&format!(" SLOT {slot}"));
    }
    cmd.push_str(&format!(" PHYSICAL {lsn}"));
    if let Some(tli) = timeline {
        cmd.push_str(&format!(" {tli}"));
    }
    cmd
}

pub fn start_replication_logical(
    slot: &str,
    lsn: Lsn,
    options: &[(&str, &str)],
) -> String {
    let mut cmd = format!("START_REPLICATION SLOT {slot} LOGICAL {lsn}");
    if !options.is_empty() {
        let opts = options
            .iter()
            .map(|(k, v)| format!("\"{k}\" '{v}'"))
            .collect::<Vec<_>>()
            .join(", ");
        cmd.push_str(&format!(" ({opts})"));
    }
    cmd
}

pub fn base_backup(options: &[(&str, Option<&str>)]) -> String {
    let mut cmd = String::from("BASE_BACKUP");
    if !options.is_empty() {
        let opts = options
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{k} '{v}'"),
                None => k.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", ");
        cmd.push_str(&format!(" ({opts})"));
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(major: u32, minor: u32) -> ServerVersion {
        ServerVersion {
            major,
            minor: Some(minor),
            build: None,
            revision: None,
            release_type: crate::version::ReleaseType::Release,
            pre_release: None,
        }
    }

    #[test]
    fn physical_slot_uses_new_syntax_on_15() {
        let opts = CreatePhysicalSlotOptions { temporary: false, reserve_wal: true };
        let cmd = create_replication_slot_physical("s", &opts, &server(15, 0)).unwrap();
        assert_eq!(cmd, "CREATE_REPLICATION_SLOT s PHYSICAL (RESERVE_WAL)");
    }

    #[test]
    fn physical_slot_uses_legacy_syntax_before_15() {
        let opts = CreatePhysicalSlotOptions { temporary: false, reserve_wal: true };
        let cmd = create_replication_slot_physical("s", &opts, &server(14, 0)).unwrap();
        assert_eq!(cmd, "CREATE_REPLICATION_SLOT s PHYSICAL RESERVE_WAL");
    }

    #[test]
    fn temporary_before_10_is_rejected() {
        let opts = CreatePhysicalSlotOptions { temporary: true, reserve_wal: false };
        let err = create_replication_slot_physical("s", &opts, &server(9, 6)).unwrap_err();
        assert!(matches!(err, Error::Unsupported { feature: "TEMPORARY", .. }));
    }

    #[test]
    fn logical_slot_new_syntax_combines_snapshot_and_two_phase() {
        let opts = CreateLogicalSlotOptions {
            temporary: false,
            snapshot_action: Some(SnapshotAction::Export),
            two_phase: true,
        };
        let cmd = create_replication_slot_logical("s", "pgoutput", &opts, &server(16, 0)).unwrap();
        assert_eq!(
            cmd,
            "CREATE_REPLICATION_SLOT s LOGICAL pgoutput (SNAPSHOT 'export', TWO_PHASE)"
        );
    }

    #[test]
    fn logical_slot_legacy_syntax() {
        let opts = CreateLogicalSlotOptions {
            temporary: false,
            snapshot_action: Some(SnapshotAction::Use),
            two_phase: false,
        };
        let cmd = create_replication_slot_logical("s", "pgoutput", &opts, &server(11, 0)).unwrap();
        assert_eq!(cmd, "CREATE_REPLICATION_SLOT s LOGICAL pgoutput USE_SNAPSHOT");
    }

    #[test]
    fn two_phase_before_15_is_rejected() {
        let opts = CreateLogicalSlotOptions {
            temporary: false,
            snapshot_action: None,
            two_phase: true,
        };
        let err = create_replication_slot_logical("s", "pgoutput", &opts, &server(14, 9)).unwrap_err();
        assert!(matches!(err, Error::Unsupported { feature: "TWO_PHASE", .. }));
    }

    #[test]
    fn start_replication_logical_quotes_options() {
        let lsn = Lsn::new(0x100000000);
        let cmd = start_replication_logical("sub", lsn, &[("proto_version", "1"), ("publication_names", "\"p\"")]);
        assert_eq!(
            cmd,
            "START_REPLICATION SLOT sub LOGICAL 1/0 (\"proto_version\" '1', \"publication_names\" '\"p\"')"
        );
    }

    #[test]
    fn start_replication_physical_with_timeline() {
        let lsn = Lsn::new(0x1_0000_0000);
        let cmd = start_replication_physical(Some("phys"), lsn, Some(3));
        assert_eq!(cmd, "START_REPLICATION SLOT phys PHYSICAL 1/0 3");
    }

    #[test]
    fn drop_slot_with_wait() {
        assert_eq!(drop_replication_slot("s", true), "DROP_REPLICATION_SLOT s WAIT");
        assert_eq!(drop_replication_slot("s", false), "DROP_REPLICATION_SLOT s");
    }
}
