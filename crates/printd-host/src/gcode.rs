//! G-code parser and dispatcher.
//!
//! Owns the host's logical print position, coordinate and unit modes,
//! and the lifecycle between ingested commands and the toolhead/heater
//! subsystems. Input arrives as raw byte blocks from a file descriptor
//! registered with the reactor; responses go back out the same
//! descriptor.
//!
//! Re-entrancy: command handlers that wait (M109, M190, M400, PID_TUNE)
//! pump the reactor, during which the fd callback may fire again. The
//! nested callback only buffers input, fires M112 immediately, and
//! de-registers the descriptor until the outer pump returns.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, error, info};

use mcu_io::FdHandle;
use motion::{Axis, Coord, Homing};
use thermal::Heater;

use crate::fan::PrinterFan;
use crate::printer::Printer;
use crate::reactor::{fd_read, fd_write};
use crate::servo::Servo;
use crate::toolhead::Toolhead;

/// Errors a command handler surfaces as a `!!` reply.
#[derive(Debug, Error)]
pub enum GCodeError {
    #[error("Error on '{original}': unable to parse {value}")]
    ParseValue { original: String, value: String },
    #[error("Error on '{original}': missing {name}")]
    MissingParam { original: String, name: String },
    #[error("Unable to parse move '{0}'")]
    ParseMove(String),
    /// Unexpected failure inside a handler; triggers a forced shutdown.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// One tokenized command line: the `LETTER+VALUE` command plus a
/// letter-keyed parameter map. The raw line is kept for error messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Params {
    pub command: String,
    pub original: String,
    pairs: HashMap<String, String>,
}

impl Params {
    /// Tokenize one line: strip `;` comments, split on letter runs
    /// (`[A-Za-z_]+` or a lone `*`), pair each with the following value
    /// text. A leading `N` line-number pair is skipped for command
    /// selection.
    pub fn parse(line: &str) -> Params {
        let original = line.trim();
        let line = match original.find(';') {
            Some(pos) => &original[..pos],
            None => original,
        };
        let chars: Vec<char> = line.chars().collect();
        let is_key_start = |c: char| c.is_ascii_alphabetic() || c == '_' || c == '*';
        let mut pair_list: Vec<(String, String)> = Vec::new();
        let mut i = 0;
        while i < chars.len() && !is_key_start(chars[i]) {
            i += 1;
        }
        while i < chars.len() {
            let mut key = String::new();
            if chars[i] == '*' {
                key.push('*');
                i += 1;
            } else {
                while i < chars.len() && (chars[i].is_ascii_alphabetic() || chars[i] == '_') {
                    key.push(chars[i]);
                    i += 1;
                }
            }
            let value_start = i;
            while i < chars.len() && !is_key_start(chars[i]) {
                i += 1;
            }
            let value: String = chars[value_start..i].iter().collect();
            pair_list.push((key.to_uppercase(), value.trim().to_string()));
        }
        let pairs: HashMap<String, String> = pair_list.iter().cloned().collect();
        // Skip a line number at the start of the command
        let first = match pair_list.first() {
            Some((k, _)) if k == "N" => 1,
            _ => 0,
        };
        let command = pair_list
            .get(first)
            .map(|(k, v)| format!("{}{}", k, v))
            .unwrap_or_default();
        Params {
            command,
            original: original.to_string(),
            pairs,
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.pairs.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs.get(name).map(String::as_str)
    }

    pub fn get_int(&self, name: &str, default: Option<i64>) -> Result<i64, GCodeError> {
        match self.pairs.get(name) {
            Some(raw) => raw.parse().map_err(|_| GCodeError::ParseValue {
                original: self.original.clone(),
                value: raw.clone(),
            }),
            None => default.ok_or_else(|| GCodeError::MissingParam {
                original: self.original.clone(),
                name: name.to_string(),
            }),
        }
    }

    pub fn get_float(&self, name: &str, default: Option<f64>) -> Result<f64, GCodeError> {
        match self.pairs.get(name) {
            Some(raw) => raw.parse().map_err(|_| GCodeError::ParseValue {
                original: self.original.clone(),
                value: raw.clone(),
            }),
            None => default.ok_or_else(|| GCodeError::MissingParam {
                original: self.original.clone(),
                name: name.to_string(),
            }),
        }
    }
}

type Handler = fn(&GCodeParser, &Params) -> Result<(), GCodeError>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Requires {
    Nothing,
    BedHeater,
    Fan,
    Servo,
}

struct CmdSpec {
    name: &'static str,
    aliases: &'static [&'static str],
    when_not_ready: bool,
    requires: Requires,
    help: Option<&'static str>,
    handler: Handler,
}

macro_rules! cmd {
    ($name:literal, $handler:path) => {
        cmd!($name, $handler, aliases: &[], not_ready: false, requires: Requires::Nothing, help: None)
    };
    ($name:literal, $handler:path, aliases: $aliases:expr) => {
        cmd!($name, $handler, aliases: $aliases, not_ready: false, requires: Requires::Nothing, help: None)
    };
    ($name:literal, $handler:path, not_ready: $nr:expr) => {
        cmd!($name, $handler, aliases: &[], not_ready: $nr, requires: Requires::Nothing, help: None)
    };
    ($name:literal, $handler:path, not_ready: $nr:expr, help: $help:expr) => {
        cmd!($name, $handler, aliases: &[], not_ready: $nr, requires: Requires::Nothing, help: $help)
    };
    ($name:literal, $handler:path, requires: $req:expr) => {
        cmd!($name, $handler, aliases: &[], not_ready: false, requires: $req, help: None)
    };
    ($name:literal, $handler:path, aliases: $aliases:expr, not_ready: $nr:expr, requires: $req:expr, help: $help:expr) => {
        CmdSpec {
            name: $name,
            aliases: $aliases,
            when_not_ready: $nr,
            requires: $req,
            help: $help,
            handler: $handler,
        }
    };
}

static COMMANDS: &[CmdSpec] = &[
    cmd!("G1", GCodeParser::cmd_g1, aliases: &["G0"]),
    cmd!("G4", GCodeParser::cmd_g4),
    cmd!("G20", GCodeParser::cmd_g20),
    cmd!("G21", GCodeParser::cmd_g21),
    cmd!("G28", GCodeParser::cmd_g28),
    cmd!("G90", GCodeParser::cmd_g90),
    cmd!("G91", GCodeParser::cmd_g91),
    cmd!("G92", GCodeParser::cmd_g92),
    cmd!("M18", GCodeParser::cmd_m18, aliases: &["M84"]),
    cmd!("M82", GCodeParser::cmd_m82),
    cmd!("M83", GCodeParser::cmd_m83),
    cmd!("M104", GCodeParser::cmd_m104),
    cmd!("M105", GCodeParser::cmd_m105, not_ready: true),
    cmd!("M109", GCodeParser::cmd_m109),
    cmd!("M110", GCodeParser::cmd_m110, not_ready: true),
    cmd!("M112", GCodeParser::cmd_m112, not_ready: true),
    cmd!("M114", GCodeParser::cmd_m114, not_ready: true),
    cmd!("M115", GCodeParser::cmd_m115, not_ready: true),
    cmd!("M140", GCodeParser::cmd_m140, requires: Requires::BedHeater),
    cmd!("M190", GCodeParser::cmd_m190, requires: Requires::BedHeater),
    cmd!("M106", GCodeParser::cmd_m106, requires: Requires::Fan),
    cmd!("M107", GCodeParser::cmd_m107, requires: Requires::Fan),
    cmd!("M206", GCodeParser::cmd_m206),
    cmd!("M280", GCodeParser::cmd_m280, requires: Requires::Servo),
    cmd!("M400", GCodeParser::cmd_m400),
    cmd!("HELP", GCodeParser::cmd_help, not_ready: true),
    cmd!("QUERY_ENDSTOPS", GCodeParser::cmd_query_endstops,
         aliases: &["M119"], not_ready: false, requires: Requires::Nothing,
         help: Some("Report on the status of each endstop")),
    cmd!("PID_TUNE", GCodeParser::cmd_pid_tune,
         aliases: &["M303"], not_ready: false, requires: Requires::Nothing,
         help: Some("Run PID Tuning")),
    cmd!("CLEAR_SHUTDOWN", GCodeParser::cmd_clear_shutdown, not_ready: true,
         help: Some("Clear a firmware shutdown and restart")),
    cmd!("RESTART", GCodeParser::cmd_restart, not_ready: true,
         help: Some("Reload config file and restart host software")),
    cmd!("FIRMWARE_RESTART", GCodeParser::cmd_firmware_restart, not_ready: true,
         help: Some("Restart firmware, host, and reload config")),
    cmd!("STATUS", GCodeParser::cmd_status, not_ready: true,
         help: Some("Report the printer status")),
];

fn lookup_command(cmd: &str) -> Option<&'static CmdSpec> {
    static TABLE: OnceLock<HashMap<&'static str, &'static CmdSpec>> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        let mut table = HashMap::new();
        for spec in COMMANDS {
            table.insert(spec.name, spec);
            for alias in spec.aliases {
                table.insert(*alias, spec);
            }
        }
        table
    });
    table.get(cmd).copied()
}

/// Input-side state, split out so the reactor fd callback can run while
/// a command handler (borrowing the rest of the parser) is pumping.
struct InputState {
    fd_handle: Option<FdHandle>,
    /// Tail bytes until the next newline.
    partial: Vec<u8>,
    /// Complete lines awaiting dispatch.
    pending: VecDeque<String>,
    bytes_read: u64,
    /// Ring of recent raw reads for debug dumps.
    input_log: VecDeque<(f64, Vec<u8>)>,
    is_processing: bool,
    saw_eof: bool,
}

/// Host position and mode state mutated by motion commands.
struct GState {
    /// Feedrate in units/second (F values arrive in units/minute).
    speed: f64,
    absolutecoord: bool,
    absoluteextrude: bool,
    base_position: Coord,
    /// The authoritative host-side logical head position in user
    /// coordinates.
    last_position: Coord,
    /// M206 home offsets, folded into `base_position` on G28.
    homing_add: Coord,
}

pub struct GCodeParser {
    printer: Rc<Printer>,
    fd: RawFd,
    is_fileinput: bool,
    input: RefCell<InputState>,
    st: RefCell<GState>,
    toolhead: Rc<RefCell<Toolhead>>,
    heater_bed: Option<Arc<Heater>>,
    fan: Option<Rc<PrinterFan>>,
    servos: Vec<Rc<Servo>>,
    is_printer_ready: Cell<bool>,
    need_ack: Cell<bool>,
}

const INPUT_LOG_SIZE: usize = 50;

impl GCodeParser {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        printer: Rc<Printer>,
        toolhead: Rc<RefCell<Toolhead>>,
        heater_bed: Option<Arc<Heater>>,
        fan: Option<Rc<PrinterFan>>,
        servos: Vec<Rc<Servo>>,
        fd: RawFd,
        is_fileinput: bool,
    ) -> Rc<GCodeParser> {
        let parser = Rc::new(GCodeParser {
            printer,
            fd,
            is_fileinput,
            input: RefCell::new(InputState {
                fd_handle: None,
                partial: Vec::new(),
                pending: VecDeque::new(),
                bytes_read: 0,
                input_log: VecDeque::with_capacity(INPUT_LOG_SIZE),
                is_processing: false,
                saw_eof: false,
            }),
            st: RefCell::new(GState {
                speed: 25.,
                absolutecoord: true,
                absoluteextrude: true,
                base_position: [0.; 4],
                last_position: [0.; 4],
                homing_add: [0.; 4],
            }),
            toolhead,
            heater_bed,
            fan,
            servos,
            is_printer_ready: Cell::new(false),
            need_ack: Cell::new(false),
        });
        if !is_fileinput {
            parser.register_fd();
        }
        parser
    }

    /// Flip readiness. File input only starts draining once ready.
    pub fn set_printer_ready(self: &Rc<Self>, is_ready: bool) {
        if self.is_printer_ready.get() == is_ready {
            return;
        }
        self.is_printer_ready.set(is_ready);
        if is_ready {
            self.printer.set_state_message("Printer is ready");
            if self.is_fileinput && self.input.borrow().fd_handle.is_none() {
                self.register_fd();
            }
        }
    }

    pub fn stats(&self) -> String {
        format!("gcodein={}", self.input.borrow().bytes_read)
    }

    /// Log the retained ring of raw input reads.
    pub fn dump_debug(&self) {
        let input = self.input.borrow();
        info!("Dumping gcode input {} blocks", input.input_log.len());
        for (eventtime, data) in &input.input_log {
            info!("Read {:.6}: {:?}", eventtime, String::from_utf8_lossy(data));
        }
    }

    pub fn last_position(&self) -> Coord {
        self.st.borrow().last_position
    }

    pub fn base_position(&self) -> Coord {
        self.st.borrow().base_position
    }

    pub fn homing_add(&self) -> Coord {
        self.st.borrow().homing_add
    }

    pub fn speed(&self) -> f64 {
        self.st.borrow().speed
    }

    pub fn toolhead(&self) -> &Rc<RefCell<Toolhead>> {
        &self.toolhead
    }

    pub fn printer(&self) -> &Rc<Printer> {
        &self.printer
    }

    fn register_fd(self: &Rc<Self>) {
        let parser = self.clone();
        let handle = self.printer.reactor.register_fd(
            self.fd,
            Rc::new(move |eventtime| parser.process_data(eventtime)),
        );
        self.input.borrow_mut().fd_handle = Some(handle);
    }

    /// Reactor callback: pull a block of bytes, split it into lines, and
    /// drain the pending queue unless a handler further up the stack is
    /// already doing so.
    fn process_data(self: &Rc<Self>, eventtime: f64) {
        let mut buf = [0u8; 4096];
        let count = fd_read(self.fd, &mut buf);
        let data = &buf[..count];
        let mut input = self.input.borrow_mut();
        if input.input_log.len() >= INPUT_LOG_SIZE {
            input.input_log.pop_front();
        }
        input.input_log.push_back((eventtime, data.to_vec()));
        input.bytes_read += count as u64;
        let mut completed = 0usize;
        let mut first_line: Option<String> = None;
        for &byte in data {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&input.partial).into_owned();
                input.partial.clear();
                if first_line.is_none() {
                    first_line = Some(line.clone());
                }
                input.pending.push_back(line);
                completed += 1;
            } else {
                input.partial.push(byte);
            }
        }
        if count == 0 {
            input.saw_eof = true;
        }
        if input.is_processing {
            if completed == 0 {
                return;
            }
            // A handler up the stack is pumping the reactor. Stop
            // watching the fd until it finishes, but let an emergency
            // stop cut through immediately.
            if !self.is_fileinput {
                if let Some(line) = &first_line {
                    if line.trim().eq_ignore_ascii_case("M112") {
                        self.toolhead.borrow().force_shutdown();
                    }
                }
            }
            if let Some(handle) = input.fd_handle.take() {
                self.printer.reactor.unregister_fd(handle);
            }
            return;
        }
        input.is_processing = true;
        drop(input);
        self.process_pending();
        let mut input = self.input.borrow_mut();
        input.is_processing = false;
        let eof = input.saw_eof;
        let need_register = input.fd_handle.is_none() && !eof;
        drop(input);
        if need_register {
            self.register_fd();
        }
        if eof {
            if let Some(handle) = self.input.borrow_mut().fd_handle.take() {
                self.printer.reactor.unregister_fd(handle);
            }
            if self.is_fileinput {
                self.motor_heater_off();
                self.printer.request_exit("exit_eof");
            }
        }
    }

    fn process_pending(&self) {
        loop {
            let line = self.input.borrow_mut().pending.pop_front();
            let Some(line) = line else {
                break;
            };
            if !self.run_command(&line) {
                break;
            }
        }
    }

    /// Dispatch one line. Returns false when processing must stop (an
    /// internal error while replaying a file).
    fn run_command(&self, line: &str) -> bool {
        let params = Params::parse(line);
        if params.command.is_empty() {
            self.cmd_default(&params);
            return true;
        }
        self.need_ack.set(true);
        match self.dispatch(&params) {
            Ok(()) => {}
            Err(GCodeError::Internal(msg)) => {
                error!(command = %params.command, "{}", msg);
                self.dump_debug();
                self.toolhead.borrow().force_shutdown();
                self.respond_error(&format!("Internal error on command:\"{}\"", params.command));
                if self.is_fileinput {
                    self.printer.request_exit("exit_eof");
                    return false;
                }
            }
            Err(e) => self.respond_error(&e.to_string()),
        }
        self.ack(None);
        true
    }

    fn dispatch(&self, params: &Params) -> Result<(), GCodeError> {
        let cmd = params.command.as_str();
        // Tool change commands are dynamic: T0 .. T<n-1>
        if let Some(index) = cmd.strip_prefix('T').and_then(|r| r.parse::<usize>().ok()) {
            let extruder_count = self.toolhead.borrow().extruders.len();
            if self.is_printer_ready.get() && extruder_count > 1 && index < extruder_count {
                return self.tool_change(index);
            }
            self.cmd_default(params);
            return Ok(());
        }
        match lookup_command(cmd) {
            Some(spec)
                if self.command_available(spec)
                    && (self.is_printer_ready.get() || spec.when_not_ready) =>
            {
                (spec.handler)(self, params)
            }
            _ => {
                self.cmd_default(params);
                Ok(())
            }
        }
    }

    fn command_available(&self, spec: &CmdSpec) -> bool {
        match spec.requires {
            Requires::Nothing => true,
            Requires::BedHeater => self.heater_bed.is_some(),
            Requires::Fan => self.fan.is_some(),
            Requires::Servo => !self.servos.is_empty(),
        }
    }

    // Response handling

    fn write_out(&self, msg: &str) {
        fd_write(self.fd, msg.as_bytes());
    }

    fn ack(&self, msg: Option<&str>) {
        if !self.need_ack.get() || self.is_fileinput {
            return;
        }
        match msg {
            Some(msg) => self.write_out(&format!("ok {}\n", msg)),
            None => self.write_out("ok\n"),
        }
        self.need_ack.set(false);
    }

    fn respond(&self, msg: &str) {
        debug!("{}", msg);
        if self.is_fileinput {
            return;
        }
        self.write_out(&format!("{}\n", msg));
    }

    fn respond_info(&self, msg: &str) {
        let lines: Vec<&str> = msg.trim().lines().map(str::trim).collect();
        self.respond(&format!("// {}", lines.join("\n// ")));
    }

    fn respond_error(&self, msg: &str) {
        let lines: Vec<&str> = msg.trim().lines().collect();
        if lines.len() > 1 {
            self.respond_info(&lines[..lines.len() - 1].join("\n"));
        }
        let last = lines.last().map(|l| l.trim()).unwrap_or("");
        self.respond(&format!("!! {}", last));
    }

    // Temperature helpers

    fn get_temp_report(&self) -> String {
        if !self.is_printer_ready.get() {
            return "T:0".to_string();
        }
        let mut out = Vec::new();
        {
            let toolhead = self.toolhead.borrow();
            for extruder in &toolhead.extruders {
                let (cur, target) = extruder.heater.get_temp();
                let index = if toolhead.extruders.len() == 1 {
                    String::new()
                } else {
                    extruder.index.to_string()
                };
                out.push(format!("T{}:{:.1} /{:.1}", index, cur, target));
            }
        }
        if let Some(bed) = &self.heater_bed {
            let (cur, target) = bed.get_temp();
            out.push(format!("B:{:.1} /{:.1}", cur, target));
        }
        out.join(" ")
    }

    /// Poll a heater until it settles, echoing temperature reports once
    /// a second. Skipped entirely when replaying a file.
    fn bg_temp(&self, heater: &Arc<Heater>) {
        if self.is_fileinput {
            return;
        }
        let mut eventtime = self.printer.reactor.monotonic();
        while self.is_printer_ready.get() && !self.printer.mcu.is_shutdown() && heater.check_busy()
        {
            self.toolhead.borrow_mut().get_last_move_time();
            self.respond(&self.get_temp_report());
            eventtime = self.printer.reactor.pause(eventtime + 1.);
        }
    }

    fn set_temp_cmd(
        &self,
        heater: &Arc<Heater>,
        params: &Params,
        wait: bool,
    ) -> Result<(), GCodeError> {
        let print_time = self.toolhead.borrow_mut().get_last_move_time();
        let temp = params.get_float("S", Some(0.))?;
        if let Err(e) = heater.set_temp(print_time, temp) {
            self.respond_error(&e.to_string());
            return Ok(());
        }
        if wait {
            self.bg_temp(heater);
        }
        Ok(())
    }

    fn extruder_set_temp(&self, params: &Params, wait: bool) -> Result<(), GCodeError> {
        let heater = if !params.has("T") {
            self.toolhead.borrow().current_extruder().heater.clone()
        } else {
            let index = params.get_int("T", Some(-1))?;
            let found = {
                let toolhead = self.toolhead.borrow();
                usize::try_from(index)
                    .ok()
                    .and_then(|i| toolhead.extruders.get(i).cloned())
            };
            match found {
                Some(extruder) => extruder.heater.clone(),
                None => {
                    self.respond_info(&format!("Invalid extruder index: {}", index));
                    return Ok(());
                }
            }
        };
        self.set_temp_cmd(&heater, params, wait)
    }

    /// Wait until the device clock passes the last scheduled move.
    fn wait_moves(&self) {
        if self.printer.mcu.is_fileoutput() {
            return;
        }
        loop {
            let target = self.toolhead.borrow().print_time();
            let now = self.printer.reactor.monotonic();
            if self.printer.mcu.estimated_print_time(now) >= target
                || self.printer.mcu.is_shutdown()
            {
                return;
            }
            self.printer.reactor.pause(now + 0.100);
        }
    }

    /// Cut motors, zero every heater target, and stop the fan.
    pub fn motor_heater_off(&self) {
        let (print_time, extruders) = {
            let mut toolhead = self.toolhead.borrow_mut();
            toolhead.motor_off();
            (toolhead.get_last_move_time(), toolhead.extruders.clone())
        };
        for extruder in &extruders {
            let _ = extruder.heater.set_temp(print_time, 0.);
        }
        if let Some(bed) = &self.heater_bed {
            let _ = bed.set_temp(print_time, 0.);
        }
        if let Some(fan) = &self.fan {
            fan.set_speed(print_time, 0.);
        }
    }

    fn prep_restart(&self) {
        if self.is_printer_ready.get() {
            self.respond_info("Preparing to restart...");
            self.motor_heater_off();
            self.toolhead.borrow_mut().dwell(0.500);
            self.wait_moves();
        }
    }

    // Individual command handlers

    fn cmd_default(&self, params: &Params) {
        if !self.is_printer_ready.get() {
            self.respond_error(&self.printer.get_state_message());
            return;
        }
        if params.command.is_empty() {
            debug!("empty command line: {:?}", params.original);
            return;
        }
        self.respond(&format!("echo:Unknown command:\"{}\"", params.command));
    }

    fn cmd_g1(&self, params: &Params) -> Result<(), GCodeError> {
        const AXIS_LETTERS: [&str; 4] = ["X", "Y", "Z", "E"];
        let mut values: [Option<f64>; 4] = [None; 4];
        let mut speed_value: Option<f64> = None;
        let mut parse_failed = false;
        for (i, letter) in AXIS_LETTERS.iter().enumerate() {
            if let Some(raw) = params.get(letter) {
                match raw.parse::<f64>() {
                    Ok(v) => values[i] = Some(v),
                    Err(_) => parse_failed = true,
                }
            }
        }
        if let Some(raw) = params.get("F") {
            match raw.parse::<f64>() {
                Ok(v) => speed_value = Some(v),
                Err(_) => parse_failed = true,
            }
        }
        if parse_failed {
            let pos = self.toolhead.borrow().get_position();
            self.st.borrow_mut().last_position = pos;
            return Err(GCodeError::ParseMove(params.original.clone()));
        }
        {
            let mut st = self.st.borrow_mut();
            for (i, value) in values.iter().enumerate() {
                if let Some(v) = value {
                    if !st.absolutecoord || (i > 2 && !st.absoluteextrude) {
                        // Value relative to position of last move
                        st.last_position[i] += v;
                    } else {
                        // Value relative to base coordinate position
                        st.last_position[i] = v + st.base_position[i];
                    }
                }
            }
            if let Some(f) = speed_value {
                st.speed = f / 60.;
            }
        }
        let (pos, speed) = {
            let st = self.st.borrow();
            (st.last_position, st.speed)
        };
        let result = self.toolhead.borrow_mut().move_to(pos, speed);
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_endstop_error() => {
                self.respond_error(&e.to_string());
                let pos = self.toolhead.borrow().get_position();
                self.st.borrow_mut().last_position = pos;
                Ok(())
            }
            Err(e) => Err(GCodeError::Internal(e.to_string())),
        }
    }

    fn cmd_g4(&self, params: &Params) -> Result<(), GCodeError> {
        // Dwell: S in seconds, P in milliseconds
        let delay = if params.has("S") {
            params.get_float("S", None)?
        } else {
            params.get_float("P", Some(0.))? / 1000.
        };
        self.toolhead.borrow_mut().dwell(delay);
        Ok(())
    }

    fn cmd_g20(&self, _params: &Params) -> Result<(), GCodeError> {
        self.respond_error("Machine does not support G20 (inches) command");
        Ok(())
    }

    fn cmd_g21(&self, _params: &Params) -> Result<(), GCodeError> {
        // Units are always millimeters
        Ok(())
    }

    fn cmd_g28(&self, params: &Params) -> Result<(), GCodeError> {
        let mut axes = Vec::new();
        for (letter, axis) in [("X", Axis::X), ("Y", Axis::Y), ("Z", Axis::Z)] {
            if params.has(letter) {
                axes.push(axis);
            }
        }
        if axes.is_empty() {
            axes = vec![Axis::X, Axis::Y, Axis::Z];
        }
        let mut homing = Homing::new(axes);
        if self.is_fileinput {
            homing.set_no_verify_retract();
        }
        let result = self.toolhead.borrow_mut().home(&mut homing);
        if let Err(e) = result {
            self.toolhead.borrow_mut().motor_off();
            self.respond_error(&e.to_string());
            return Ok(());
        }
        let newpos = self.toolhead.borrow().get_position();
        let mut st = self.st.borrow_mut();
        for axis in homing.axes() {
            let i = axis.index();
            st.last_position[i] = newpos[i];
            st.base_position[i] = -st.homing_add[i];
        }
        Ok(())
    }

    fn cmd_g90(&self, _params: &Params) -> Result<(), GCodeError> {
        self.st.borrow_mut().absolutecoord = true;
        Ok(())
    }

    fn cmd_g91(&self, _params: &Params) -> Result<(), GCodeError> {
        self.st.borrow_mut().absolutecoord = false;
        Ok(())
    }

    fn cmd_g92(&self, params: &Params) -> Result<(), GCodeError> {
        const AXIS_LETTERS: [&str; 4] = ["X", "Y", "Z", "E"];
        let mut offsets: [Option<f64>; 4] = [None; 4];
        for (i, letter) in AXIS_LETTERS.iter().enumerate() {
            if params.has(letter) {
                offsets[i] = Some(params.get_float(letter, None)?);
            }
        }
        let mut st = self.st.borrow_mut();
        if offsets.iter().all(Option::is_none) {
            st.base_position = st.last_position;
            return Ok(());
        }
        for (i, offset) in offsets.iter().enumerate() {
            if let Some(offset) = offset {
                st.base_position[i] = st.last_position[i] - offset;
            }
        }
        Ok(())
    }

    fn cmd_m82(&self, _params: &Params) -> Result<(), GCodeError> {
        self.st.borrow_mut().absoluteextrude = true;
        Ok(())
    }

    fn cmd_m83(&self, _params: &Params) -> Result<(), GCodeError> {
        self.st.borrow_mut().absoluteextrude = false;
        Ok(())
    }

    fn cmd_m18(&self, _params: &Params) -> Result<(), GCodeError> {
        self.toolhead.borrow_mut().motor_off();
        Ok(())
    }

    fn cmd_m104(&self, params: &Params) -> Result<(), GCodeError> {
        self.extruder_set_temp(params, false)
    }

    fn cmd_m105(&self, _params: &Params) -> Result<(), GCodeError> {
        let report = self.get_temp_report();
        self.ack(Some(&report));
        Ok(())
    }

    fn cmd_m109(&self, params: &Params) -> Result<(), GCodeError> {
        self.extruder_set_temp(params, true)
    }

    fn cmd_m110(&self, _params: &Params) -> Result<(), GCodeError> {
        // Line number reset; nothing to track
        Ok(())
    }

    fn cmd_m112(&self, _params: &Params) -> Result<(), GCodeError> {
        self.toolhead.borrow().force_shutdown();
        Ok(())
    }

    fn cmd_m114(&self, _params: &Params) -> Result<(), GCodeError> {
        let kinpos = self.toolhead.borrow().get_position();
        let last = self.st.borrow().last_position;
        self.respond(&format!(
            "X:{:.3} Y:{:.3} Z:{:.3} E:{:.3} Count X:{:.3} Y:{:.3} Z:{:.3}",
            last[0], last[1], last[2], last[3], kinpos[0], kinpos[1], kinpos[2]
        ));
        Ok(())
    }

    fn cmd_m115(&self, _params: &Params) -> Result<(), GCodeError> {
        let msg = format!(
            "FIRMWARE_NAME:printd FIRMWARE_VERSION:{}",
            env!("CARGO_PKG_VERSION")
        );
        self.ack(Some(&msg));
        Ok(())
    }

    fn cmd_m140(&self, params: &Params) -> Result<(), GCodeError> {
        match &self.heater_bed {
            Some(bed) => self.set_temp_cmd(bed, params, false),
            None => Ok(()),
        }
    }

    fn cmd_m190(&self, params: &Params) -> Result<(), GCodeError> {
        match &self.heater_bed {
            Some(bed) => self.set_temp_cmd(bed, params, true),
            None => Ok(()),
        }
    }

    fn cmd_m106(&self, params: &Params) -> Result<(), GCodeError> {
        let value = params.get_float("S", Some(255.))? / 255.;
        let print_time = self.toolhead.borrow_mut().get_last_move_time();
        if let Some(fan) = &self.fan {
            fan.set_speed(print_time, value);
        }
        Ok(())
    }

    fn cmd_m107(&self, _params: &Params) -> Result<(), GCodeError> {
        let print_time = self.toolhead.borrow_mut().get_last_move_time();
        if let Some(fan) = &self.fan {
            fan.set_speed(print_time, 0.);
        }
        Ok(())
    }

    fn cmd_m206(&self, params: &Params) -> Result<(), GCodeError> {
        const AXIS_LETTERS: [&str; 4] = ["X", "Y", "Z", "E"];
        for (i, letter) in AXIS_LETTERS.iter().enumerate() {
            if params.has(letter) {
                let offset = params.get_float(letter, None)?;
                let mut st = self.st.borrow_mut();
                st.base_position[i] += st.homing_add[i] - offset;
                st.homing_add[i] = offset;
            }
        }
        Ok(())
    }

    fn cmd_m280(&self, params: &Params) -> Result<(), GCodeError> {
        if !params.has("P") && !params.has("S") {
            for (i, servo) in self.servos.iter().enumerate() {
                self.respond_info(&format!("Servo P{}: {}", i, servo.name()));
            }
            return Ok(());
        }
        let index = params.get_int("P", None)?;
        let servo = usize::try_from(index)
            .ok()
            .and_then(|i| self.servos.get(i).cloned());
        let Some(servo) = servo else {
            self.respond_info(&format!(
                "There is no servo P{}. Enter \"M280\" to list servos",
                index
            ));
            return Ok(());
        };
        let position = params.get_int("S", None)?;
        let print_time = self.toolhead.borrow_mut().get_last_move_time();
        if position < 200 {
            // Position in degrees
            servo.set_angle(print_time, position as f64);
            self.respond_info(&format!("Set servo P{} to {} degrees", index, position));
        } else {
            // Position is a pulse width in microseconds
            servo.set_pulsewidth(print_time, position as f64 / 1_000_000.);
            self.respond_info(&format!("Set servo P{} to {} microseconds", index, position));
        }
        Ok(())
    }

    fn cmd_m400(&self, _params: &Params) -> Result<(), GCodeError> {
        self.wait_moves();
        Ok(())
    }

    fn cmd_query_endstops(&self, _params: &Params) -> Result<(), GCodeError> {
        if self.is_fileinput {
            return Ok(());
        }
        let states = self.toolhead.borrow_mut().query_endstops();
        let report: Vec<String> = states
            .iter()
            .map(|(name, triggered)| {
                format!("{}:{}", name, if *triggered { "TRIGGERED" } else { "open" })
            })
            .collect();
        self.respond(&report.join(" "));
        Ok(())
    }

    fn cmd_pid_tune(&self, params: &Params) -> Result<(), GCodeError> {
        let index = params.get_int("E", Some(0))?;
        let temp = params.get_float("S", None)?;
        let heater = if index == -1 {
            match &self.heater_bed {
                Some(bed) => bed.clone(),
                None => {
                    self.respond_info("No heater_bed configured");
                    return Ok(());
                }
            }
        } else {
            let found = {
                let toolhead = self.toolhead.borrow();
                usize::try_from(index)
                    .ok()
                    .and_then(|i| toolhead.extruders.get(i).cloned())
            };
            match found {
                Some(extruder) => extruder.heater.clone(),
                None => {
                    self.respond_info(&format!("Invalid extruder index: {}", index));
                    return Ok(());
                }
            }
        };
        if let Err(e) = heater.start_auto_tune(temp) {
            self.respond_error(&e.to_string());
            return Ok(());
        }
        self.bg_temp(&heater);
        Ok(())
    }

    fn cmd_clear_shutdown(&self, _params: &Params) -> Result<(), GCodeError> {
        self.printer.mcu.clear_shutdown();
        self.printer.request_exit("restart");
        Ok(())
    }

    fn cmd_restart(&self, _params: &Params) -> Result<(), GCodeError> {
        self.prep_restart();
        self.printer.request_exit("restart");
        Ok(())
    }

    fn cmd_firmware_restart(&self, _params: &Params) -> Result<(), GCodeError> {
        self.prep_restart();
        self.printer.request_exit("firmware_restart");
        Ok(())
    }

    fn cmd_status(&self, _params: &Params) -> Result<(), GCodeError> {
        let msg = self.printer.get_state_message();
        if self.is_printer_ready.get() {
            self.respond_info(&msg);
        } else {
            self.respond_error(&msg);
        }
        Ok(())
    }

    fn cmd_help(&self, _params: &Params) -> Result<(), GCodeError> {
        let mut cmdhelp = Vec::new();
        if !self.is_printer_ready.get() {
            cmdhelp.push("Printer is not ready - not all commands available.".to_string());
        }
        cmdhelp.push("Available extended commands:".to_string());
        for spec in COMMANDS {
            if let Some(help) = spec.help {
                if self.command_available(spec)
                    && (self.is_printer_ready.get() || spec.when_not_ready)
                {
                    cmdhelp.push(format!("{:<10}: {}", spec.name, help));
                }
            }
        }
        self.respond_info(&cmdhelp.join("\n"));
        Ok(())
    }

    /// Switch to extruder `index`: shift the logical position by the
    /// nozzle-offset delta, dwell for deactivation, move the carriage,
    /// dwell for activation.
    fn tool_change(&self, index: usize) -> Result<(), GCodeError> {
        let (current, next) = {
            let toolhead = self.toolhead.borrow();
            (
                toolhead.current_extruder(),
                toolhead.extruders[index].clone(),
            )
        };
        if Rc::ptr_eq(&current, &next) {
            self.respond_info(&format!("{} already selected", next.name));
            return Ok(());
        }
        // XYZ offset between the nozzles
        let mut delta = [0.; 4];
        for i in 0..3 {
            delta[i] = current.nozzle_offset[i] - next.nozzle_offset[i];
        }
        {
            let mut st = self.st.borrow_mut();
            for i in 0..4 {
                st.last_position[i] += delta[i];
            }
        }
        let move_result = {
            let mut toolhead = self.toolhead.borrow_mut();
            let print_time = toolhead.get_last_move_time();
            let dwell = current.deactivate(print_time);
            toolhead.dwell(dwell);
            let pos = self.st.borrow().last_position;
            let speed = toolhead.toolchange_velocity;
            toolhead.move_to(pos, speed)
        };
        match move_result {
            Ok(()) => {
                {
                    let mut st = self.st.borrow_mut();
                    for i in 0..4 {
                        st.base_position[i] += delta[i];
                    }
                }
                {
                    let mut toolhead = self.toolhead.borrow_mut();
                    let print_time = toolhead.get_last_move_time();
                    let dwell = next.activate(print_time);
                    toolhead.dwell(dwell);
                    toolhead.current_extruder = index;
                }
                self.respond_info(&format!("Switched to: {}", next.name));
                Ok(())
            }
            Err(e) if e.is_endstop_error() => {
                self.respond_error(&e.to_string());
                let mut toolhead = self.toolhead.borrow_mut();
                let pos = toolhead.get_position();
                self.st.borrow_mut().last_position = pos;
                let print_time = toolhead.get_last_move_time();
                current.activate(print_time);
                Ok(())
            }
            Err(e) => Err(GCodeError::Internal(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_a_basic_move() {
        let params = Params::parse("G1 X10.5 Y-3 F600 ; travel");
        assert_eq!(params.command, "G1");
        assert_eq!(params.get("X"), Some("10.5"));
        assert_eq!(params.get("Y"), Some("-3"));
        assert_eq!(params.get("F"), Some("600"));
        assert_eq!(params.original, "G1 X10.5 Y-3 F600 ; travel");
    }

    #[test]
    fn command_letter_is_uppercased() {
        let params = Params::parse("m105");
        assert_eq!(params.command, "M105");
    }

    #[test]
    fn leading_line_number_is_skipped() {
        let params = Params::parse("N7 G1 X5*32");
        assert_eq!(params.command, "G1");
        assert_eq!(params.get("N"), Some("7"));
        assert_eq!(params.get("*"), Some("32"));
        assert_eq!(params.get("X"), Some("5"));
    }

    #[test]
    fn extended_commands_keep_underscores() {
        let params = Params::parse("QUERY_ENDSTOPS");
        assert_eq!(params.command, "QUERY_ENDSTOPS");
        let params = Params::parse("pid_tune e0 s210");
        assert_eq!(params.command, "PID_TUNE");
        assert_eq!(params.get("E"), Some("0"));
        assert_eq!(params.get("S"), Some("210"));
    }

    #[test]
    fn comment_only_line_has_no_command() {
        assert_eq!(Params::parse("; just a comment").command, "");
        assert_eq!(Params::parse("").command, "");
    }

    #[test]
    fn parameter_parsing_errors() {
        let params = Params::parse("G4 P1.2.3");
        match params.get_float("P", None) {
            Err(GCodeError::ParseValue { value, .. }) => assert_eq!(value, "1.2.3"),
            other => panic!("expected parse error, got {:?}", other),
        }
        match params.get_float("S", None) {
            Err(GCodeError::MissingParam { name, .. }) => assert_eq!(name, "S"),
            other => panic!("expected missing error, got {:?}", other),
        }
        assert_eq!(params.get_float("S", Some(2.)).unwrap(), 2.);
        // A value glued to trailing letters merges into one key, like the
        // original's letter-run split
        let params = Params::parse("G4 Pabc");
        assert!(params.has("PABC"));
        assert!(!params.has("P"));
    }

    #[test]
    fn aliases_resolve_to_the_same_handler() {
        assert_eq!(lookup_command("G0").unwrap().name, "G1");
        assert_eq!(lookup_command("M84").unwrap().name, "M18");
        assert_eq!(lookup_command("M119").unwrap().name, "QUERY_ENDSTOPS");
        assert_eq!(lookup_command("M303").unwrap().name, "PID_TUNE");
        assert!(lookup_command("M999").is_none());
    }
}
