//! DRDA reply builders.
//!
//! Each builder writes complete DSSes through a [`DdmWriter`]; the caller
//! decides when the chain is finalized and flushed.

use crate::code_points::*;
use crate::writer::DdmWriter;

/// Manager levels this server supports. Managers absent from the table are
/// answered with level 0.
pub const SERVER_MANAGER_LEVELS: &[(u16, u16)] = &[
    (AGENT, 7),
    (SQLAM, 7),
    (RDB, 7),
    (SECMGR, 7),
    (CMNTCPIP, 5),
    (UNICODEMGR, CCSID_1208),
];

/// Level of `manager` supported by this server.
pub fn server_manager_level(manager: u16) -> u16 {
    SERVER_MANAGER_LEVELS
        .iter()
        .find(|(cp, _)| *cp == manager)
        .map_or(0, |(_, level)| *level)
}

/// Attributes announced in EXCSATRD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub external_name: String,
    pub server_name: String,
    pub server_class: String,
    pub release_level: String,
}

impl Default for ServerIdentity {
    fn default() -> Self {
        Self {
            external_name: "OpenMainframe DRDA Server".to_string(),
            server_name: "OPENMAINFRAME".to_string(),
            server_class: "QDB2/LINUX".to_string(),
            release_level: "SQL110500".to_string(),
        }
    }
}

/// SQL communications area carried by SQLCARD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sqlca {
    pub sqlcode: i32,
    pub sqlstate: String,
    pub rows_affected: i64,
    pub message: String,
    pub rdbnam: String,
}

impl Sqlca {
    pub fn success(rows_affected: i64) -> Self {
        Self::error(0, "00000", "").with_rows(rows_affected)
    }

    pub fn error(sqlcode: i32, sqlstate: &str, message: &str) -> Self {
        Self {
            sqlcode,
            sqlstate: sqlstate.to_string(),
            rows_affected: 0,
            message: message.to_string(),
            rdbnam: String::new(),
        }
    }

    pub fn with_rows(mut self, rows_affected: i64) -> Self {
        self.rows_affected = rows_affected;
        self
    }

    pub fn with_rdbnam(mut self, rdbnam: &str) -> Self {
        self.rdbnam = rdbnam.to_string();
        self
    }
}

/// Procedure name reported in SQLERRPROC.
const SQLERRPROC: &str = "OMDDM01";

// ── EXCSATRD ─────────────────────────────────────────────

/// Reply to EXCSAT with this server's attributes and, for every manager the
/// requester listed, the level this server supports.
pub fn write_excsatrd(writer: &mut DdmWriter, identity: &ServerIdentity, requested: &[(u16, u16)]) {
    writer.create_dss_reply();
    writer.start_ddm(EXCSATRD);
    writer.write_scalar_string(EXTNAM, &identity.external_name);
    if !requested.is_empty() {
        writer.start_ddm(MGRLVLLS);
        for (manager, _) in requested {
            writer.write_code_point_4_bytes(*manager, server_manager_level(*manager));
        }
        writer.end_ddm();
    }
    writer.write_scalar_string(SRVCLSNM, &identity.server_class);
    writer.write_scalar_string(SRVNAM, &identity.server_name);
    writer.write_scalar_string(SRVRLSLV, &identity.release_level);
    writer.end_ddm_and_dss();
}

// ── SQLCARD / SQLERRRM ───────────────────────────────────

/// SQLCARD in its own OBJDSS.
pub fn write_sqlcard(writer: &mut DdmWriter, sqlca: &Sqlca) {
    writer.create_dss_object();
    writer.start_ddm(SQLCARD);
    write_sqlca_grp(writer, sqlca);
    writer.end_ddm_and_dss();
}

/// SQLCAGRP: null indicator, SQLCODE, SQLSTATE, SQLERRPROC, then SQLCAXGRP
/// and an absent SQLDIAGGRP.
fn write_sqlca_grp(writer: &mut DdmWriter, sqlca: &Sqlca) {
    writer.write_byte(0x00);
    writer.write_int(sqlca.sqlcode);
    writer.write_padded_string(truncate(&sqlca.sqlstate, 5), 5);
    writer.write_padded_string(SQLERRPROC, 8);

    // SQLCAXGRP
    writer.write_byte(0x00);
    writer.write_int(0);
    writer.write_int(0);
    writer.write_long(sqlca.rows_affected);
    writer.write_int(0);
    writer.write_int(0);
    let space = writer.ccsid_manager().space();
    writer.pad_bytes(space, 11);
    writer.write_ld_string(&sqlca.rdbnam);
    if writer.write_ld_string(&sqlca.message).is_some() {
        tracing::debug!(sqlcode = sqlca.sqlcode, "SQLERRMSG truncated");
    }
    writer.write_ld_string("");

    // SQLDIAGGRP
    writer.write_byte(0xFF);
}

/// SQL error reply: SQLERRRM in an RPYDSS followed by the SQLCARD.
pub fn write_sql_error_reply(writer: &mut DdmWriter, svrcod: u16, sqlca: &Sqlca) {
    writer.create_dss_reply();
    writer.start_ddm(SQLERRRM);
    writer.write_scalar_2_bytes(SVRCOD, svrcod);
    if !sqlca.rdbnam.is_empty() {
        writer.write_scalar_string(RDBNAM, &sqlca.rdbnam);
    }
    writer.end_ddm_and_dss();
    write_sqlcard(writer, sqlca);
}

// ── Reply messages ───────────────────────────────────────

/// SYNTAXRM for a malformed request.
pub fn write_syntaxrm(writer: &mut DdmWriter, synerrcd: u8, code_point: Option<u16>) {
    writer.create_dss_reply();
    writer.start_ddm(SYNTAXRM);
    writer.write_scalar_2_bytes(SVRCOD, SVRCOD_ERROR);
    writer.write_scalar_1_byte(SYNERRCD, synerrcd);
    if let Some(code_point) = code_point {
        writer.write_scalar_2_bytes(CODPNT, code_point);
    }
    writer.end_ddm_and_dss();
}

/// CMDNSPRM naming the unsupported command.
pub fn write_cmdnsprm(writer: &mut DdmWriter, code_point: u16) {
    writer.create_dss_reply();
    writer.start_ddm(CMDNSPRM);
    writer.write_scalar_2_bytes(SVRCOD, SVRCOD_ERROR);
    writer.write_scalar_2_bytes(CODPNT, code_point);
    writer.end_ddm_and_dss();
}

/// AGNPRMRM for a command that failed without producing a reply.
pub fn write_agnprmrm(writer: &mut DdmWriter, rdbnam: Option<&str>) {
    writer.create_dss_reply();
    writer.start_ddm(AGNPRMRM);
    writer.write_scalar_2_bytes(SVRCOD, SVRCOD_ACCDMG);
    if let Some(rdbnam) = rdbnam {
        writer.write_scalar_string(RDBNAM, rdbnam);
    }
    writer.end_ddm_and_dss();
}

fn truncate(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((index, _)) => &value[..index],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccsid::CcsidManager;
    use crate::ddm::parse_ddm_list;
    use crate::reader::DssReader;

    async fn read_all(writer: &DdmWriter) -> Vec<(u8, Vec<crate::ddm::DdmObject>)> {
        let bytes = writer.buffer_contents(0);
        let mut input = &bytes[..];
        let mut reader = DssReader::for_replies();
        let mut out = Vec::new();
        while !input.is_empty() {
            let dss = reader.read_dss(&mut input).await.unwrap();
            out.push((dss.dss_type(), parse_ddm_list(&dss.payload).unwrap()));
        }
        out
    }

    #[tokio::test]
    async fn excsatrd_answers_requested_managers() {
        let mut writer = DdmWriter::new();
        let identity = ServerIdentity::default();
        write_excsatrd(&mut writer, &identity, &[(AGENT, 10), (UNICODEMGR, 1208), (CCSIDMGR, 500)]);

        let dsses = read_all(&writer).await;
        assert_eq!(dsses.len(), 1);
        let excsatrd = &dsses[0].1[0];
        assert_eq!(excsatrd.code_point, EXCSATRD);
        assert_eq!(
            excsatrd.string_param(SRVCLSNM, CcsidManager::Ebcdic).unwrap().as_deref(),
            Some("QDB2/LINUX")
        );
        let levels = excsatrd.find_param(MGRLVLLS).unwrap().unwrap();
        let mut expected = Vec::new();
        for (cp, level) in [(AGENT, 7u16), (UNICODEMGR, 1208), (CCSIDMGR, 0)] {
            expected.extend_from_slice(&cp.to_be_bytes());
            expected.extend_from_slice(&level.to_be_bytes());
        }
        assert_eq!(levels.payload, expected);
    }

    #[tokio::test]
    async fn sql_error_reply_is_rpydss_then_objdss() {
        let mut writer = DdmWriter::new();
        let sqlca = Sqlca::error(-204, "42704", "TABLE NOT FOUND").with_rdbnam("SAMPLE");
        write_sql_error_reply(&mut writer, SVRCOD_ERROR, &sqlca);

        let dsses = read_all(&writer).await;
        assert_eq!(dsses.len(), 2);
        assert_eq!(dsses[0].0, DSSFMT_RPYDSS);
        let sqlerrrm = &dsses[0].1[0];
        assert_eq!(sqlerrrm.code_point, SQLERRRM);
        assert_eq!(sqlerrrm.u16_param(SVRCOD).unwrap(), Some(SVRCOD_ERROR));

        assert_eq!(dsses[1].0, DSSFMT_OBJDSS);
        let sqlcard = &dsses[1].1[0];
        assert_eq!(sqlcard.code_point, SQLCARD);
        let mut cursor = sqlcard.cursor(CcsidManager::Ebcdic);
        assert_eq!(cursor.read_u8().unwrap(), 0x00);
        assert_eq!(cursor.read_network_int().unwrap() as i32, -204);
        assert_eq!(cursor.read_string(5).unwrap(), "42704");
        assert_eq!(cursor.read_string(8).unwrap(), "OMDDM01 ");
    }

    #[tokio::test]
    async fn sqlcard_carries_row_count_and_message() {
        let mut writer = DdmWriter::new();
        write_sqlcard(&mut writer, &Sqlca::success(42));

        let dsses = read_all(&writer).await;
        let sqlcard = &dsses[0].1[0];
        let mut cursor = sqlcard.cursor(CcsidManager::Ebcdic);
        cursor.skip(1 + 4 + 5 + 8 + 1 + 4 + 4).unwrap();
        assert_eq!(cursor.read_network_long().unwrap(), 42);
        cursor.skip(4 + 4 + 11).unwrap();
        assert_eq!(cursor.read_ld_string().unwrap(), "");
        assert_eq!(cursor.read_ld_string().unwrap(), "");
        assert_eq!(cursor.read_ld_string().unwrap(), "");
        assert_eq!(cursor.read_u8().unwrap(), 0xFF);
        assert!(cursor.is_empty());
    }

    #[tokio::test]
    async fn syntaxrm_layout() {
        let mut writer = DdmWriter::new();
        write_syntaxrm(&mut writer, SYNERRCD_CBYTE_NOT_D0, Some(EXCSAT));
        let bytes = writer.buffer_contents(0);
        assert_eq!(bytes.len(), 6 + 4 + 6 + 5 + 6);

        let dsses = read_all(&writer).await;
        let syntaxrm = &dsses[0].1[0];
        assert_eq!(syntaxrm.code_point, SYNTAXRM);
        assert_eq!(syntaxrm.find_param(SYNERRCD).unwrap().unwrap().payload, vec![0x03]);
        assert_eq!(syntaxrm.u16_param(CODPNT).unwrap(), Some(EXCSAT));
    }

    #[tokio::test]
    async fn cmdnsprm_and_agnprmrm() {
        let mut writer = DdmWriter::new();
        write_cmdnsprm(&mut writer, OPNQRY);
        write_agnprmrm(&mut writer, None);

        let dsses = read_all(&writer).await;
        assert_eq!(dsses[0].1[0].u16_param(CODPNT).unwrap(), Some(OPNQRY));
        assert_eq!(dsses[1].1[0].code_point, AGNPRMRM);
        assert_eq!(dsses[1].1[0].u16_param(SVRCOD).unwrap(), Some(SVRCOD_ACCDMG));
    }

    #[test]
    fn truncate_on_char_boundary() {
        assert_eq!(truncate("4270499", 5), "42704");
        assert_eq!(truncate("ab", 5), "ab");
    }
}
