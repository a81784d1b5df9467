//! DDM code points and DSS constants.
//!
//! References: DRDA Volume 3 (DDM architecture).

// ── DSS envelope ─────────────────────────────────────────
/// DSS magic byte at offset 2 of every DSS header.
pub const DSS_ID: u8 = 0xD0;
/// Length of the DSS header.
pub const DSS_HEADER_LEN: usize = 6;
/// Largest DSS (or continuation segment) in bytes, header included.
pub const MAX_DSS_LENGTH: usize = 32767;
/// Data bytes carried by one full continuation segment.
pub const CONTINUATION_SEGMENT_DATA: usize = MAX_DSS_LENGTH - 2;
/// Top bit of a 2-byte length field: continuation / extended length follows.
pub const CONTINUATION_BIT: u16 = 0x8000;

/// DSS format: request.
pub const DSSFMT_RQSDSS: u8 = 0x01;
/// DSS format: reply.
pub const DSSFMT_RPYDSS: u8 = 0x02;
/// DSS format: object (command or reply data).
pub const DSSFMT_OBJDSS: u8 = 0x03;
/// DSS format: communication.
pub const DSSFMT_CMNDSS: u8 = 0x04;

/// Chain byte: last DSS of the chain.
pub const DSS_NOCHAIN: u8 = 0x00;
/// Chain byte: chained, next DSS has a different correlator.
pub const DSSCHAIN: u8 = 0x40;
/// Chain byte: chained, next DSS has the same correlator.
pub const DSSCHAIN_SAME_ID: u8 = 0x50;
/// Chain byte flag: continue processing the chain after an error.
pub const DSSCHAIN_ERROR_CONTINUE: u8 = 0x20;
/// Mask of the chain bits in the format byte.
pub const DSSCHAIN_MASK: u8 = 0xF0;

// ── Commands ─────────────────────────────────────────────
/// Exchange Server Attributes.
pub const EXCSAT: u16 = 0x1041;
/// Access Security.
pub const ACCSEC: u16 = 0x106D;
/// Security Check.
pub const SECCHK: u16 = 0x106E;
/// Access RDB.
pub const ACCRDB: u16 = 0x2001;
/// Execute Immediate SQL.
pub const EXCSQLIMM: u16 = 0x200A;
/// Open Query.
pub const OPNQRY: u16 = 0x200C;
/// Continue Query.
pub const CNTQRY: u16 = 0x2005;
/// Close Query.
pub const CLSQRY: u16 = 0x2004;
/// Prepare SQL Statement.
pub const PRPSQLSTT: u16 = 0x200D;
/// Execute SQL Statement.
pub const EXCSQLSTT: u16 = 0x200B;
/// RDB Commit Unit of Work.
pub const RDBCMM: u16 = 0x200E;
/// RDB Rollback Unit of Work.
pub const RDBRLLBCK: u16 = 0x200F;

// ── Reply data and messages ──────────────────────────────
/// Exchange Server Attributes Reply Data.
pub const EXCSATRD: u16 = 0x1443;
/// SQL Communications Area Reply Data.
pub const SQLCARD: u16 = 0x2408;
/// SQL Error Reply Message.
pub const SQLERRRM: u16 = 0x2213;
/// Query Answer Set Data.
pub const QRYDTA: u16 = 0x241B;
/// Externalized FD:OCA Data (LOB values).
pub const EXTDTA: u16 = 0x146C;
/// SQL statement text.
pub const SQLSTT: u16 = 0x2414;
/// Data Stream Syntax Error.
pub const SYNTAXRM: u16 = 0x124C;
/// Command Not Supported.
pub const CMDNSPRM: u16 = 0x1250;
/// Command Check.
pub const CMDCHKRM: u16 = 0x1254;
/// Permanent Agent Error.
pub const AGNPRMRM: u16 = 0x1232;

// ── DDM parameters ───────────────────────────────────────
/// External Name.
pub const EXTNAM: u16 = 0x115E;
/// Manager-Level List.
pub const MGRLVLLS: u16 = 0x1404;
/// Server Class Name.
pub const SRVCLSNM: u16 = 0x1147;
/// Server Name.
pub const SRVNAM: u16 = 0x116D;
/// Server Product Release Level.
pub const SRVRLSLV: u16 = 0x115A;
/// Severity Code.
pub const SVRCOD: u16 = 0x1149;
/// Syntax Error Code.
pub const SYNERRCD: u16 = 0x114A;
/// Code Point (names the offending object in error replies).
pub const CODPNT: u16 = 0x000C;
/// RDB Name.
pub const RDBNAM: u16 = 0x2110;
/// Data Type Definition Name.
pub const TYPDEFNAM: u16 = 0x002F;
/// Query Block Size.
pub const QRYBLKSZ: u16 = 0x2114;

// ── Managers ─────────────────────────────────────────────
/// Agent.
pub const AGENT: u16 = 0x1403;
/// SQL Application Manager.
pub const SQLAM: u16 = 0x2407;
/// RDB manager.
pub const RDB: u16 = 0x240F;
/// Security Manager.
pub const SECMGR: u16 = 0x1440;
/// TCP/IP Communication Manager.
pub const CMNTCPIP: u16 = 0x1474;
/// CCSID Manager.
pub const CCSIDMGR: u16 = 0x14CC;
/// Unicode Manager.
pub const UNICODEMGR: u16 = 0x1C08;

/// CCSID for UTF-8; requesting it at UNICODEMGR switches the session to UTF-8.
pub const CCSID_1208: u16 = 1208;

// ── SYNERRCD values ──────────────────────────────────────
pub const SYNERRCD_DSS_LESS_THAN_6: u8 = 0x01;
pub const SYNERRCD_CBYTE_NOT_D0: u8 = 0x03;
pub const SYNERRCD_FBYTE_NOT_SUPPORTED: u8 = 0x04;
pub const SYNERRCD_OBJ_LEN_LESS_THAN_4: u8 = 0x07;
/// Object length not allowed; also used for objects overrunning their DSS.
pub const SYNERRCD_OBJ_LEN_NOT_ALLOWED: u8 = 0x0B;
pub const SYNERRCD_INCORRECT_EXTENDED_LEN: u8 = 0x0C;
/// An RQSDSS arrived where command data (OBJDSS) was expected.
pub const SYNERRCD_INVALID_CORRELATOR: u8 = 0x13;
pub const SYNERRCD_DSS_CONT_LESS_OR_EQUAL_2: u8 = 0x16;
pub const SYNERRCD_CHAIN_OFF_SAME_NEXT_CORRELATOR: u8 = 0x18;
pub const SYNERRCD_CORRELATOR_MISMATCH: u8 = 0x19;
pub const SYNERRCD_CHAIN_OFF_ERROR_CONTINUE: u8 = 0x1A;

// ── Severity codes ───────────────────────────────────────
pub const SVRCOD_INFO: u16 = 0x0000;
pub const SVRCOD_WARNING: u16 = 0x0004;
pub const SVRCOD_ERROR: u16 = 0x0008;
pub const SVRCOD_SEVERE: u16 = 0x0010;
pub const SVRCOD_ACCDMG: u16 = 0x0014;
pub const SVRCOD_PRMDMG: u16 = 0x0018;

/// Human-readable name for the code points this crate emits or routes,
/// used in log fields.
pub fn code_point_name(code_point: u16) -> &'static str {
    match code_point {
        EXCSAT => "EXCSAT",
        EXCSATRD => "EXCSATRD",
        ACCSEC => "ACCSEC",
        SECCHK => "SECCHK",
        ACCRDB => "ACCRDB",
        EXCSQLIMM => "EXCSQLIMM",
        OPNQRY => "OPNQRY",
        CNTQRY => "CNTQRY",
        CLSQRY => "CLSQRY",
        PRPSQLSTT => "PRPSQLSTT",
        EXCSQLSTT => "EXCSQLSTT",
        RDBCMM => "RDBCMM",
        RDBRLLBCK => "RDBRLLBCK",
        SQLCARD => "SQLCARD",
        SQLERRRM => "SQLERRRM",
        QRYDTA => "QRYDTA",
        EXTDTA => "EXTDTA",
        SQLSTT => "SQLSTT",
        SYNTAXRM => "SYNTAXRM",
        CMDNSPRM => "CMDNSPRM",
        CMDCHKRM => "CMDCHKRM",
        AGNPRMRM => "AGNPRMRM",
        _ => "UNKNOWN",
    }
}
