//! End-to-end tests: a full printer stack wired to one end of a
//! socketpair, driven through the poll reactor exactly as the binary
//! drives it.

use std::io::Write;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use float_cmp::approx_eq;

use mcu_io::{Mcu, Reactor};
use printd_host::config::PrinterConfig;
use printd_host::gcode::GCodeParser;
use printd_host::printer::build_printer;
use printd_host::reactor::PollReactor;
use sim::SimMcu;

const CONFIG: &str = "\
[printer]
kinematics = corexy
max_velocity = 300
max_accel = 3000
max_z_velocity = 25
max_z_accel = 100

[stepper_x]
step_pin = x_step
dir_pin = x_dir
enable_pin = x_enable
endstop_pin = x_stop
step_distance = .0125
position_endstop = 0
position_max = 200
homing_speed = 50

[stepper_y]
step_pin = y_step
dir_pin = y_dir
enable_pin = y_enable
endstop_pin = y_stop
step_distance = .0125
position_endstop = 0
position_max = 200
homing_speed = 50

[stepper_z]
step_pin = z_step
dir_pin = z_dir
enable_pin = z_enable
endstop_pin = z_stop
step_distance = .0025
position_endstop = 0
position_max = 200

[extruder]
heater_pin = e_heat
sensor_pin = e_temp
sensor_type = EPCOS 100K B57560G104F
control = pid
pid_Kp = 22.2
pid_Ki = 1.08
pid_Kd = 114
min_temp = 0
max_temp = 250

[heater_bed]
heater_pin = bed_heat
sensor_pin = bed_temp
sensor_type = EPCOS 100K B57560G104F
control = watermark
min_temp = 0
max_temp = 130

[fan]
pin = fan_pin

[servo0]
servo_pin = srv
";

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    let r = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(r, 0, "socketpair failed");
    (fds[0], fds[1])
}

fn send_bytes(fd: RawFd, data: &str) {
    let mut rest = data.as_bytes();
    while !rest.is_empty() {
        let r = unsafe { libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) };
        assert!(r > 0, "socket write failed");
        rest = &rest[r as usize..];
    }
}

fn read_available(fd: RawFd) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let r = unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if r <= 0 {
            break;
        }
        out.extend_from_slice(&buf[..r as usize]);
    }
    String::from_utf8_lossy(&out).into_owned()
}

struct TestPrinter {
    parser: Rc<GCodeParser>,
    reactor: Rc<dyn Reactor>,
    mcu: Arc<SimMcu>,
    peer: RawFd,
    host_fd: RawFd,
}

impl TestPrinter {
    fn build(config_text: &str, ready: bool) -> TestPrinter {
        let config = PrinterConfig::parse(config_text).unwrap();
        let (host_fd, peer) = socketpair();
        let reactor: Rc<dyn Reactor> = Rc::new(PollReactor::new());
        let mcu = Arc::new(SimMcu::new(false));
        let parser =
            build_printer(&config, mcu.clone(), reactor.clone(), host_fd, false).unwrap();
        if ready {
            parser.set_printer_ready(true);
        }
        TestPrinter {
            parser,
            reactor,
            mcu,
            peer,
            host_fd,
        }
    }

    /// Let the reactor run long enough to drain pending input.
    fn pump(&self) {
        let now = self.reactor.monotonic();
        self.reactor.pause(now + 0.05);
    }

    fn send(&self, data: &str) {
        send_bytes(self.peer, data);
        self.pump();
    }

    fn responses(&self) -> String {
        read_available(self.peer)
    }
}

impl Drop for TestPrinter {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.peer);
            libc::close(self.host_fd);
        }
    }
}

#[test]
fn absolute_move_after_homing() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("G28\n");
    let homed_steps = printer.mcu.step_log().len();
    printer.send("G90\nG1 X10 Y0 F600\n");

    assert_eq!(printer.parser.last_position(), [10., 0., 0., 0.]);
    assert_eq!(printer.parser.speed(), 10.);
    // CoreXY: an X-only move drives both belts by the same amount
    let inv_step_dist = 1. / 0.0125;
    for pin in ["x_step", "y_step"] {
        let total: f64 = printer.mcu.step_log()[homed_steps..]
            .iter()
            .filter(|r| r.stepper == pin)
            .map(|r| r.count)
            .sum();
        assert!(
            approx_eq!(f64, total, 10. * inv_step_dist, epsilon = 1e-9),
            "{}: {} steps",
            pin,
            total
        );
    }
    assert!(printer.responses().contains("ok\n"));
}

#[test]
fn relative_moves_accumulate() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("G28\nG91\nG1 X5\nG1 X5\n");
    assert_eq!(printer.parser.last_position()[0], 10.);
}

#[test]
fn g92_rebases_the_extruder_axis() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("G1 E42 F300\n");
    assert_eq!(printer.parser.last_position()[3], 42.);
    printer.send("G92 E0\n");
    assert_eq!(printer.parser.base_position()[3], 42.);
    assert_eq!(printer.parser.last_position()[3], 42.);
    printer.send("G1 E1\n");
    assert_eq!(printer.parser.last_position()[3], 43.);
}

#[test]
fn unhomed_move_is_rejected_and_resynced() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("G1 X10\n");
    let responses = printer.responses();
    assert!(
        responses.contains("!! Move out of range") && responses.contains("Must home axis first"),
        "got: {}",
        responses
    );
    // The logical position resyncs to the toolhead after the rejection
    assert_eq!(printer.parser.last_position(), [0., 0., 0., 0.]);
}

#[test]
fn m112_forces_shutdown_in_the_same_turn() {
    let printer = TestPrinter::build(CONFIG, true);
    assert!(!printer.mcu.is_shutdown());
    printer.send("M112\n");
    assert!(printer.mcu.is_shutdown());
}

#[test]
fn m112_cuts_through_a_temperature_wait() {
    let printer = TestPrinter::build(CONFIG, true);
    let peer = printer.peer;
    let writer = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(150));
        send_bytes(peer, "M112\n");
    });
    // M109 pumps the reactor until the heater settles; the nested fd
    // callback must fire the emergency stop immediately.
    printer.send("M109 S210\n");
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while !printer.mcu.is_shutdown() {
        assert!(std::time::Instant::now() < deadline, "M112 never fired");
        printer.pump();
    }
    writer.join().unwrap();
}

#[test]
fn readiness_gates_most_commands() {
    let printer = TestPrinter::build(CONFIG, false);
    printer.send("G1 X5\n");
    let responses = printer.responses();
    assert!(responses.contains("!!"), "got: {}", responses);
    printer.send("M105\n");
    assert!(printer.responses().contains("ok T:0"));
    printer.send("M114\n");
    assert!(printer.responses().contains("X:0.000 Y:0.000"));
}

#[test]
fn unknown_commands_echo() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("M999\n");
    assert!(printer
        .responses()
        .contains("echo:Unknown command:\"M999\""));
}

#[test]
fn g28_applies_home_offsets() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("M206 X5\n");
    assert_eq!(printer.parser.homing_add()[0], 5.);
    printer.send("G28\n");
    assert_eq!(printer.parser.base_position()[0], -5.);
    assert_eq!(printer.parser.last_position()[0], 0.);
}

#[test]
fn failed_homing_cuts_motors_and_reports() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.mcu.endstop("x_stop").unwrap().set_home_failure(true);
    printer.send("G28\n");
    let responses = printer.responses();
    assert!(responses.contains("!! No trigger on x_stop"), "got: {}", responses);
    // Motors were cut, so all axes are unhomed again
    printer.send("G1 Y5\n");
    assert!(printer.responses().contains("Must home axis first"));
}

#[test]
fn m114_reports_logical_and_commanded_position() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("G28\nG1 X10 Y5 F600\nM114\n");
    assert!(printer
        .responses()
        .contains("X:10.000 Y:5.000 Z:0.000 E:0.000 Count X:10.000 Y:5.000 Z:0.000"));
}

#[test]
fn m105_reports_heater_temperatures() {
    let printer = TestPrinter::build(CONFIG, true);
    let sensor = thermal::Sensor::lookup("EPCOS 100K B57560G104F", 5., 4700.).unwrap();
    printer.mcu.adc("e_temp").unwrap().deliver(1., sensor.calc_adc(24.96));
    printer.send("M104 S210\nM105\n");
    let responses = printer.responses();
    assert!(responses.contains("ok T:25.0 /210.0 B:0.0 /0.0"), "got: {}", responses);
}

#[test]
fn query_endstops_reports_each_switch() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.mcu.endstop("y_stop").unwrap().set_triggered(true);
    printer.send("QUERY_ENDSTOPS\n");
    assert!(printer
        .responses()
        .contains("stepper_x:open stepper_y:TRIGGERED stepper_z:open"));
    // M119 is an alias
    printer.send("M119\n");
    assert!(printer.responses().contains("stepper_y:TRIGGERED"));
}

#[test]
fn m280_drives_a_servo() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("M280 P0 S90\n");
    assert!(printer.responses().contains("Set servo P0 to 90 degrees"));
    assert_eq!(printer.mcu.pwm_log_for("srv").len(), 1);
    printer.send("M280 P3 S90\n");
    assert!(printer.responses().contains("There is no servo P3"));
}

#[test]
fn fan_commands_write_pwm() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("M106 S127.5\n");
    let writes = printer.mcu.pwm_log_for("fan_pin");
    assert_eq!(writes.len(), 1);
    assert!(approx_eq!(f64, writes[0].value, 0.5, epsilon = 1e-9));
    printer.send("M107\n");
    assert_eq!(printer.mcu.pwm_log_for("fan_pin").len(), 2);
}

#[test]
fn g20_is_rejected() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("G20\n");
    assert!(printer
        .responses()
        .contains("!! Machine does not support G20 (inches) command"));
}

#[test]
fn help_lists_extended_commands() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("HELP\n");
    let responses = printer.responses();
    assert!(responses.contains("// Available extended commands:"));
    assert!(responses.contains("QUERY_ENDSTOPS"));
    assert!(responses.contains("RESTART"));
}

#[test]
fn restart_requests_exit() {
    let printer = TestPrinter::build(CONFIG, true);
    printer.send("RESTART\n");
    assert_eq!(printer.parser.printer().exit_requested().as_deref(), Some("restart"));
}

const MULTI_EXTRUDER: &str = "\
[extruder0]
heater_pin = e0_heat
sensor_pin = e0_temp
sensor_type = EPCOS 100K B57560G104F
control = pid
pid_Kp = 22.2
pid_Ki = 1.08
pid_Kd = 114
min_temp = 0
max_temp = 250

[extruder1]
heater_pin = e1_heat
sensor_pin = e1_temp
sensor_type = EPCOS 100K B57560G104F
control = pid
pid_Kp = 22.2
pid_Ki = 1.08
pid_Kd = 114
min_temp = 0
max_temp = 250
nozzle_offset_x = -10
";

fn multi_extruder_config() -> String {
    let base = CONFIG.replace("[extruder]\n", "[old_extruder]\n");
    format!("{}\n{}", base, MULTI_EXTRUDER)
}

#[test]
fn tool_change_shifts_by_the_nozzle_offset() {
    let config = multi_extruder_config();
    let printer = TestPrinter::build(&config, true);
    printer.send("G28\nT1\n");
    assert!(printer.responses().contains("Switched to: extruder1"));
    assert_eq!(printer.parser.toolhead().borrow().current_extruder, 1);
    assert_eq!(printer.parser.last_position()[0], 10.);
    assert_eq!(printer.parser.base_position()[0], 10.);
    printer.send("T1\n");
    assert!(printer.responses().contains("already selected"));
}

#[test]
fn m104_targets_a_specific_extruder() {
    let config = multi_extruder_config();
    let printer = TestPrinter::build(&config, true);
    printer.send("M104 T1 S210\n");
    let toolhead = printer.parser.toolhead().borrow();
    assert_eq!(toolhead.extruders[1].heater.get_temp().1, 210.);
    assert_eq!(toolhead.extruders[0].heater.get_temp().1, 0.);
    drop(toolhead);
    printer.send("M104 T7 S210\n");
    assert!(printer.responses().contains("Invalid extruder index: 7"));
}

#[test]
fn file_input_suppresses_acks_and_exits_on_eof() {
    let path = std::env::temp_dir().join(format!("printd-test-{}.gcode", std::process::id()));
    {
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"G28\nG1 X10 Y0 F600\nM104 S200\nM140 S60\n")
            .unwrap();
    }
    let config = PrinterConfig::parse(CONFIG).unwrap();
    let file = std::fs::File::open(&path).unwrap();
    let reactor: Rc<dyn Reactor> = Rc::new(PollReactor::new());
    let mcu = Arc::new(SimMcu::new(true));
    let parser = build_printer(
        &config,
        mcu.clone(),
        reactor.clone(),
        std::os::unix::io::AsRawFd::as_raw_fd(&file),
        true,
    )
    .unwrap();
    parser.set_printer_ready(true);
    for _ in 0..100 {
        if parser.printer().exit_requested().is_some() {
            break;
        }
        let now = reactor.monotonic();
        reactor.pause(now + 0.02);
    }
    assert_eq!(parser.printer().exit_requested().as_deref(), Some("exit_eof"));
    // The move made it through
    assert_eq!(parser.last_position()[0], 10.);
    // EOF turned the heaters back off
    let toolhead = parser.toolhead().borrow();
    assert_eq!(toolhead.extruders[0].heater.get_temp().1, 0.);
    drop(toolhead);
    let _ = std::fs::remove_file(&path);
}
