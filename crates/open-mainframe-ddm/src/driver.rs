//! Per-connection protocol loop.
//!
//! The driver reads one request at a time (a command RQSDSS plus any
//! same-correlator OBJDSS command data), hands it to a [`CommandHandler`]
//! and closes out the reply chain once the request's chaining is known.
//!
//! ```text
//! wait (timeout → on_idle, shutdown → exit)
//!   └─ read request ─ mark ─ dispatch ─┬─ ok
//!                                      └─ error → clear to mark → error reply
//!      finalize_chain(chain state) ── repeat while chained
//! ```
//!
//! EXCSAT is answered by the driver itself; it is also where the session's
//! string encoding is settled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite};
use tokio::sync::watch;

use crate::ccsid::CcsidManager;
use crate::code_points::*;
use crate::config::DrdaServerConfig;
use crate::ddm::{parse_ddm_list, DdmCursor, DdmObject, DDM_HEADER_LEN};
use crate::error::{CommandError, DrdaError, DrdaResult};
use crate::reader::DssReader;
use crate::response::{
    write_agnprmrm, write_cmdnsprm, write_excsatrd, write_sql_error_reply, write_syntaxrm,
    ServerIdentity, Sqlca,
};
use crate::stats::ServerStats;
use crate::trace::{ComBufferTrace, TracingComBufferTrace};
use crate::writer::DdmWriter;

/// One inbound command with its command data.
#[derive(Debug, Clone)]
pub struct Request {
    pub command: DdmObject,
    /// Objects from the OBJDSSes chained to the command with its correlator.
    pub objects: Vec<DdmObject>,
    pub correlation_id: u16,
    /// Chain state after the request: [`DSS_NOCHAIN`] or [`DSSCHAIN`].
    pub chain_state: u8,
}

impl Request {
    pub fn code_point(&self) -> u16 {
        self.command.code_point
    }

    /// First command data object with the given code point.
    pub fn object(&self, code_point: u16) -> Option<&DdmObject> {
        self.objects.iter().find(|o| o.code_point == code_point)
    }
}

/// Attributes the requester sent with EXCSAT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppRequester {
    pub external_name: Option<String>,
    pub server_name: Option<String>,
    pub server_class: Option<String>,
    pub release_level: Option<String>,
    /// (manager, level) pairs from MGRLVLLS, in the order received.
    pub manager_levels: Vec<(u16, u16)>,
}

impl AppRequester {
    /// Collect the attributes of an EXCSAT command.
    pub fn from_excsat(excsat: &DdmObject, ccsid: CcsidManager) -> DrdaResult<Self> {
        let mut requester = AppRequester::default();
        for param in excsat.params()? {
            let text = || Some(ccsid.decode(&param.payload).trim_end().to_string());
            match param.code_point {
                EXTNAM => requester.external_name = text(),
                SRVNAM => requester.server_name = text(),
                SRVCLSNM => requester.server_class = text(),
                SRVRLSLV => requester.release_level = text(),
                MGRLVLLS => requester.manager_levels = parse_manager_levels(&param.payload)?,
                other => tracing::debug!(
                    code_point = %format!("0x{other:04X}"),
                    "Ignoring EXCSAT parameter"
                ),
            }
        }
        Ok(requester)
    }

    pub fn manager_level(&self, manager: u16) -> Option<u16> {
        self.manager_levels
            .iter()
            .find(|(cp, _)| *cp == manager)
            .map(|(_, level)| *level)
    }

    /// Whether the requester asked for UTF-8 strings.
    pub fn requests_unicode(&self) -> bool {
        self.manager_level(UNICODEMGR) == Some(CCSID_1208)
    }
}

fn parse_manager_levels(payload: &[u8]) -> DrdaResult<Vec<(u16, u16)>> {
    if payload.len() % 4 != 0 {
        return Err(DrdaError::Syntax {
            code: SYNERRCD_OBJ_LEN_NOT_ALLOWED,
            code_point: Some(MGRLVLLS),
        });
    }
    Ok(payload
        .chunks_exact(4)
        .map(|pair| {
            (
                u16::from_be_bytes([pair[0], pair[1]]),
                u16::from_be_bytes([pair[2], pair[3]]),
            )
        })
        .collect())
}

/// Executes commands for one connection.
///
/// `handle` writes complete reply DSSes through `writer`. It may stream LOB
/// data straight to `sink` with
/// [`DdmWriter::write_scalar_stream`]; everything else stays buffered until
/// the driver finalizes the chain. On error, whatever the handler buffered is
/// discarded and replaced by a standard error reply.
#[async_trait]
pub trait CommandHandler: Send {
    async fn handle(
        &mut self,
        request: &Request,
        writer: &mut DdmWriter,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), CommandError>;

    /// Called when no request arrived within the read timeout.
    fn on_idle(&mut self) {}
}

enum WaitEvent {
    Ready,
    Idle,
    Closed,
    Shutdown,
}

/// Drives one connection from its first EXCSAT to disconnect.
pub struct ConnectionDriver<H> {
    reader: DssReader,
    writer: DdmWriter,
    handler: H,
    identity: ServerIdentity,
    database: String,
    app_requester: Option<AppRequester>,
    read_timeout: Option<Duration>,
    stats: Arc<ServerStats>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<H: CommandHandler> ConnectionDriver<H> {
    pub fn new(handler: H) -> Self {
        Self::from_config(handler, &DrdaServerConfig::default())
    }

    pub fn from_config(handler: H, config: &DrdaServerConfig) -> Self {
        let mut reader = DssReader::new();
        let mut writer = DdmWriter::with_capacity(config.buffer_size);
        writer.set_stream_out_buffer_size(config.stream_out_buffer_size);
        writer.set_long_ld_strings(config.long_ld_strings);
        if config.trace_buffers {
            let trace: Arc<dyn ComBufferTrace> = Arc::new(TracingComBufferTrace);
            reader.set_trace(Some(Arc::clone(&trace)));
            writer.set_trace(Some(trace));
        }
        Self {
            reader,
            writer,
            handler,
            identity: config.server_identity(),
            database: config.database.clone(),
            app_requester: None,
            read_timeout: config.read_timeout(),
            stats: Arc::new(ServerStats::new()),
            shutdown: None,
        }
    }

    /// Share server-wide counters.
    pub fn with_stats(mut self, stats: Arc<ServerStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Stop between chains once the watched value turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Attributes from the most recent EXCSAT.
    pub fn app_requester(&self) -> Option<&AppRequester> {
        self.app_requester.as_ref()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn writer(&self) -> &DdmWriter {
        &self.writer
    }

    pub fn reader(&self) -> &DssReader {
        &self.reader
    }

    pub fn bytes_received(&self) -> u64 {
        self.reader.total_byte_count()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.writer.total_byte_count()
    }

    /// Serve requests until the peer disconnects or shutdown is signalled.
    ///
    /// A malformed request is answered with SYNTAXRM and ends the connection
    /// with the syntax error.
    pub async fn run<R, W>(&mut self, mut input: R, mut output: W) -> DrdaResult<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            match self.wait_for_request(&mut input).await? {
                WaitEvent::Ready => {}
                WaitEvent::Closed => return Ok(()),
                WaitEvent::Shutdown => {
                    tracing::info!("DRDA connection closing for shutdown");
                    return Ok(());
                }
                WaitEvent::Idle => continue,
            }

            self.stats.record_chain();
            match self.process_chain(&mut input, &mut output).await {
                Ok(()) => {}
                Err(DrdaError::Syntax { code, code_point }) => {
                    self.report_syntax_error(code, code_point, &mut output).await?;
                    return Err(DrdaError::Syntax { code, code_point });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the first byte of the next chain without consuming it.
    async fn wait_for_request<R>(&mut self, input: &mut R) -> DrdaResult<WaitEvent>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        loop {
            let timeout = self.read_timeout;
            let event = tokio::select! {
                biased;
                _ = shutdown_signalled(&mut self.shutdown) => WaitEvent::Shutdown,
                event = wait_readable(&mut *input, timeout) => event?,
            };
            if let WaitEvent::Idle = event {
                tracing::trace!("DRDA connection idle");
                self.handler.on_idle();
                continue;
            }
            return Ok(event);
        }
    }

    async fn process_chain<R, W>(&mut self, input: &mut R, output: &mut W) -> DrdaResult<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            let request = self.read_request(input).await?;
            self.dispatch(&request, output).await?;
            self.writer.finalize_chain(request.chain_state, output).await?;
            if request.chain_state == DSS_NOCHAIN {
                return Ok(());
            }
        }
    }

    async fn read_request<R>(&mut self, input: &mut R) -> DrdaResult<Request>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let dss = self.reader.read_dss(input).await?;
        if dss.dss_type() != DSSFMT_RQSDSS {
            return Err(DrdaError::syntax(SYNERRCD_FBYTE_NOT_SUPPORTED));
        }
        let correlation_id = dss.correlation_id;
        let command = parse_command(&dss.payload, self.reader.ccsid_manager())?;

        let mut objects = Vec::new();
        while self.reader.is_chained_with_same_id() {
            let data = self.reader.read_dss(input).await?;
            if data.dss_type() != DSSFMT_OBJDSS {
                return Err(DrdaError::Syntax {
                    code: SYNERRCD_INVALID_CORRELATOR,
                    code_point: Some(command.code_point),
                });
            }
            objects.extend(parse_ddm_list(&data.payload)?);
        }

        Ok(Request {
            command,
            objects,
            correlation_id,
            chain_state: self.reader.current_chain_state(),
        })
    }

    async fn dispatch<W>(&mut self, request: &Request, output: &mut W) -> DrdaResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let code_point = request.code_point();
        tracing::debug!(
            command = code_point_name(code_point),
            code_point = %format!("0x{code_point:04X}"),
            corr_id = request.correlation_id,
            objects = request.objects.len(),
            "DRDA command"
        );
        if code_point == EXCSAT {
            return self.exchange_server_attributes(&request.command);
        }

        let mark = self.writer.mark_dss_clear_point();
        let sent_before = self.writer.total_byte_count();
        let result = self.handler.handle(request, &mut self.writer, output).await;
        let partly_sent = self.writer.total_byte_count() != sent_before;

        let error = match result {
            Ok(()) => {
                if self.writer.position() == mark && !partly_sent {
                    tracing::warn!(
                        command = code_point_name(code_point),
                        "Command produced no reply"
                    );
                    write_agnprmrm(&mut self.writer, Some(&self.database));
                }
                return Ok(());
            }
            Err(CommandError::Protocol(e)) if e.is_fatal() => return Err(e),
            Err(e) => e,
        };

        self.stats.record_command_error();
        if partly_sent {
            return Err(DrdaError::ReplyAborted {
                code_point,
                reason: error.to_string(),
            });
        }
        self.writer.clear_dss_back_to_mark(mark);

        match error {
            CommandError::Sql {
                sqlcode,
                sqlstate,
                message,
                svrcod,
            } => {
                tracing::warn!(sqlcode, sqlstate = %sqlstate, message = %message, "SQL error");
                let sqlca = Sqlca::error(sqlcode, &sqlstate, &message).with_rdbnam(&self.database);
                write_sql_error_reply(&mut self.writer, svrcod, &sqlca);
            }
            CommandError::NotSupported(unsupported) => {
                tracing::warn!(
                    code_point = %format!("0x{unsupported:04X}"),
                    "Command not supported"
                );
                write_cmdnsprm(&mut self.writer, unsupported);
            }
            CommandError::Protocol(DrdaError::Decimal { sqlstate, message }) => {
                let sqlcode = if sqlstate == "22003" { -406 } else { -405 };
                let sqlca = Sqlca::error(sqlcode, sqlstate, &message).with_rdbnam(&self.database);
                write_sql_error_reply(&mut self.writer, SVRCOD_ERROR, &sqlca);
            }
            CommandError::Protocol(e @ DrdaError::Syntax { .. }) => return Err(e),
            CommandError::Protocol(e) => {
                tracing::error!(
                    error = %e,
                    command = code_point_name(code_point),
                    "Command failed"
                );
                write_agnprmrm(&mut self.writer, Some(&self.database));
            }
        }
        Ok(())
    }

    fn exchange_server_attributes(&mut self, excsat: &DdmObject) -> DrdaResult<()> {
        let requester = AppRequester::from_excsat(excsat, self.reader.ccsid_manager())?;
        write_excsatrd(&mut self.writer, &self.identity, &requester.manager_levels);

        // the encoding is settled by the first EXCSAT only
        let first = self.app_requester.is_none();
        if first && requester.requests_unicode() {
            self.writer.set_utf8_ccsid();
            self.reader.set_utf8_ccsid();
        }
        tracing::info!(
            requester = requester.external_name.as_deref().unwrap_or(""),
            server_class = requester.server_class.as_deref().unwrap_or(""),
            ccsid = self.writer.ccsid_manager().ccsid(),
            "DRDA attributes exchanged"
        );
        self.app_requester = Some(requester);
        Ok(())
    }

    async fn report_syntax_error<W>(
        &mut self,
        code: u8,
        code_point: Option<u16>,
        output: &mut W,
    ) -> DrdaResult<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.stats.record_syntax_error();
        tracing::warn!(
            synerrcd = %format!("0x{code:02X}"),
            code_point = ?code_point,
            "DRDA syntax error, closing connection"
        );
        write_syntaxrm(&mut self.writer, code, code_point);
        self.writer.finalize_chain(DSS_NOCHAIN, output).await
    }
}

/// A command RQSDSS carries exactly one DDM object.
fn parse_command(payload: &[u8], ccsid: CcsidManager) -> DrdaResult<DdmObject> {
    if payload.len() < DDM_HEADER_LEN {
        return Err(DrdaError::syntax(SYNERRCD_OBJ_LEN_LESS_THAN_4));
    }
    let mut cursor = DdmCursor::new(payload, ccsid);
    let header = cursor.read_length_and_code_point(false)?;
    let data = cursor.read_bytes(header.data_len)?;
    if !cursor.is_empty() {
        return Err(DrdaError::Syntax {
            code: SYNERRCD_OBJ_LEN_NOT_ALLOWED,
            code_point: Some(header.code_point),
        });
    }
    Ok(DdmObject::new(header.code_point, data.to_vec()))
}

async fn wait_readable<R>(input: &mut R, timeout: Option<Duration>) -> DrdaResult<WaitEvent>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let ready = match timeout {
        Some(limit) => match tokio::time::timeout(limit, input.fill_buf()).await {
            Ok(result) => result,
            Err(_) => return Ok(WaitEvent::Idle),
        },
        None => input.fill_buf().await,
    };
    Ok(if ready?.is_empty() {
        WaitEvent::Closed
    } else {
        WaitEvent::Ready
    })
}

/// Resolves once shutdown is requested; never without a receiver or once
/// the sender is gone.
async fn shutdown_signalled(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        if rx.wait_for(|stop| *stop).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}
