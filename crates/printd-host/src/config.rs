//! Printer configuration loader.
//!
//! Parses the INI-style `printer.cfg` format into strongly-typed section
//! structs. Option names are matched case-insensitively (the parser
//! lowercases keys); section lookups follow the original firmware's
//! conventions (`stepper_x`, `extruder`/`extruderN`, `servo`/`servoN`).

use std::path::Path;

use anyhow::{anyhow, bail, Result};
use configparser::ini::Ini;

use motion::StepperConfig;
use thermal::{ControlConfig, HeaterConfig, Sensor};

use crate::fan::FanConfig;
use crate::servo::ServoConfig;

/// The `[printer]` section.
#[derive(Debug, Clone)]
pub struct PrinterSection {
    pub kinematics: String,
    pub max_velocity: f64,
    pub max_accel: f64,
    pub max_z_velocity: f64,
    pub max_z_accel: f64,
    pub toolchange_velocity: f64,
}

/// An `[extruder]` section: heater parameters plus tool-change geometry.
#[derive(Debug, Clone)]
pub struct ExtruderConfig {
    pub name: String,
    pub index: usize,
    pub nozzle_offset: [f64; 3],
    pub heater: HeaterConfig,
    pub activate_delay: f64,
    pub deactivate_delay: f64,
}

/// The whole parsed configuration. Read-only after construction.
#[derive(Debug, Clone)]
pub struct PrinterConfig {
    pub printer: PrinterSection,
    /// stepper_x, stepper_y, stepper_z; for CoreXY the x/y entries
    /// configure the A/B belt motors.
    pub steppers: [StepperConfig; 3],
    pub extruders: Vec<ExtruderConfig>,
    pub heater_bed: Option<HeaterConfig>,
    pub fan: Option<FanConfig>,
    pub servos: Vec<ServoConfig>,
}

impl PrinterConfig {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<PrinterConfig> {
        let mut ini = Ini::new();
        ini.load(path)
            .map_err(|e| anyhow!("failed to load config {:?}: {}", path, e))?;
        Self::from_ini(&ini)
    }

    /// Parse config text directly; used by tests.
    pub fn parse(text: &str) -> Result<PrinterConfig> {
        let mut ini = Ini::new();
        ini.read(text.to_string())
            .map_err(|e| anyhow!("failed to parse config: {}", e))?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<PrinterConfig> {
        let printer = PrinterSection {
            kinematics: get_str(ini, "printer", "kinematics", None)?,
            max_velocity: get_float(ini, "printer", "max_velocity", None)?,
            max_accel: get_float(ini, "printer", "max_accel", None)?,
            max_z_velocity: get_float(ini, "printer", "max_z_velocity", Some(9999999.9))?,
            max_z_accel: get_float(ini, "printer", "max_z_accel", Some(9999999.9))?,
            toolchange_velocity: get_float(ini, "printer", "toolchange_velocity", Some(50.))?,
        };
        let steppers = [
            load_stepper(ini, "stepper_x")?,
            load_stepper(ini, "stepper_y")?,
            load_stepper(ini, "stepper_z")?,
        ];
        let mut extruders = Vec::new();
        for section in extruder_sections(ini) {
            let index = extruders.len();
            extruders.push(load_extruder(ini, &section, index)?);
        }
        let heater_bed = if ini.sections().contains(&"heater_bed".to_string()) {
            Some(load_heater(ini, "heater_bed")?)
        } else {
            None
        };
        let fan = if ini.sections().contains(&"fan".to_string()) {
            Some(FanConfig {
                pin: get_str(ini, "fan", "pin", None)?,
                max_power: get_float(ini, "fan", "max_power", Some(1.))?,
            })
        } else {
            None
        };
        let mut servos = Vec::new();
        for section in servo_sections(ini) {
            servos.push(load_servo(ini, &section)?);
        }
        Ok(PrinterConfig {
            printer,
            steppers,
            extruders,
            heater_bed,
            fan,
            servos,
        })
    }
}

/// `[extruder]` alone, or `[extruder0]`, `[extruder1]`, ... in order.
fn extruder_sections(ini: &Ini) -> Vec<String> {
    let sections = ini.sections();
    if sections.contains(&"extruder".to_string()) {
        return vec!["extruder".to_string()];
    }
    let mut out = Vec::new();
    for i in 0..99 {
        let name = format!("extruder{}", i);
        if !sections.contains(&name) {
            break;
        }
        out.push(name);
    }
    out
}

/// `[servo]` alone (registered as servo0), or `[servo0]`, `[servo1]`, ...
fn servo_sections(ini: &Ini) -> Vec<String> {
    let sections = ini.sections();
    if sections.contains(&"servo".to_string()) {
        return vec!["servo".to_string()];
    }
    let mut out = Vec::new();
    for i in 0..99 {
        let name = format!("servo{}", i);
        if !sections.contains(&name) {
            break;
        }
        out.push(name);
    }
    out
}

fn load_stepper(ini: &Ini, section: &str) -> Result<StepperConfig> {
    let step_dist = match get_opt_float(ini, section, "step_distance")? {
        Some(d) if d > 0. => d,
        Some(d) => bail!("[{}] step_distance must be positive, got {}", section, d),
        None => {
            // Accept the inverse spelling as well
            let inv = get_float(ini, section, "inv_step_dist", None)?;
            if inv <= 0. {
                bail!("[{}] inv_step_dist must be positive, got {}", section, inv);
            }
            1. / inv
        }
    };
    Ok(StepperConfig {
        name: section.to_string(),
        step_pin: get_str(ini, section, "step_pin", None)?,
        dir_pin: get_str(ini, section, "dir_pin", None)?,
        enable_pin: get_opt_str(ini, section, "enable_pin"),
        endstop_pin: get_str(ini, section, "endstop_pin", None)?,
        step_dist,
        position_min: get_float(ini, section, "position_min", Some(0.))?,
        position_max: get_float(ini, section, "position_max", None)?,
        position_endstop: get_float(ini, section, "position_endstop", None)?,
        homing_speed: get_float(ini, section, "homing_speed", Some(5.))?,
        homing_retract_dist: get_float(ini, section, "homing_retract_dist", Some(5.))?,
        homing_positive_dir: get_bool(ini, section, "homing_positive_dir", Some(false))?,
    })
}

fn load_heater(ini: &Ini, section: &str) -> Result<HeaterConfig> {
    let min_temp = get_float(ini, section, "min_temp", Some(0.))?;
    let max_temp = get_float(ini, section, "max_temp", None)?;
    if max_temp <= min_temp {
        bail!("[{}] max_temp must be above min_temp", section);
    }
    let sensor_type = get_str(ini, section, "sensor_type", None)?;
    let adc_voltage = get_float(ini, section, "adc_voltage", Some(5.))?;
    let pullup = get_float(ini, section, "pullup_resistor", Some(4700.))?;
    let sensor = Sensor::lookup(&sensor_type, adc_voltage, pullup)
        .ok_or_else(|| anyhow!("[{}] unknown sensor_type '{}'", section, sensor_type))?;
    let max_power = get_float(ini, section, "max_power", Some(1.))?;
    if max_power <= 0. || max_power > 1. {
        bail!("[{}] max_power must be in (0, 1], got {}", section, max_power);
    }
    let control = match get_str(ini, section, "control", None)?.as_str() {
        "watermark" => ControlConfig::Watermark {
            max_delta: get_float(ini, section, "max_delta", Some(2.))?,
        },
        "pid" => ControlConfig::Pid {
            kp: get_float(ini, section, "pid_kp", None)?,
            ki: get_float(ini, section, "pid_ki", None)?,
            kd: get_float(ini, section, "pid_kd", None)?,
            deriv_time: get_float(ini, section, "pid_deriv_time", Some(2.))?,
            integral_max: get_opt_float(ini, section, "pid_integral_max")?,
        },
        other => bail!("[{}] unknown control algorithm '{}'", section, other),
    };
    Ok(HeaterConfig {
        name: section.to_string(),
        heater_pin: get_str(ini, section, "heater_pin", None)?,
        sensor_pin: get_str(ini, section, "sensor_pin", None)?,
        sensor,
        control,
        min_temp,
        max_temp,
        min_extrude_temp: get_float(ini, section, "min_extrude_temp", Some(170.))?,
        max_power,
    })
}

fn load_extruder(ini: &Ini, section: &str, index: usize) -> Result<ExtruderConfig> {
    Ok(ExtruderConfig {
        name: section.to_string(),
        index,
        nozzle_offset: [
            get_float(ini, section, "nozzle_offset_x", Some(0.))?,
            get_float(ini, section, "nozzle_offset_y", Some(0.))?,
            get_float(ini, section, "nozzle_offset_z", Some(0.))?,
        ],
        heater: load_heater(ini, section)?,
        activate_delay: get_float(ini, section, "activate_delay", Some(0.))?,
        deactivate_delay: get_float(ini, section, "deactivate_delay", Some(0.))?,
    })
}

fn load_servo(ini: &Ini, section: &str) -> Result<ServoConfig> {
    Ok(ServoConfig {
        name: section.to_string(),
        servo_pin: get_str(ini, section, "servo_pin", None)?,
        minimum_pulse_width: get_float(ini, section, "minimum_pulse_width", Some(1.))? / 1_000_000.,
        maximum_pulse_width: get_float(ini, section, "maximum_pulse_width", Some(2.))? / 1_000_000.,
        maximum_servo_angle: get_float(ini, section, "maximum_servo_angle", Some(180.))?,
    })
}

fn get_str(ini: &Ini, section: &str, key: &str, default: Option<&str>) -> Result<String> {
    match ini.get(section, key) {
        Some(v) => Ok(v),
        None => default
            .map(str::to_string)
            .ok_or_else(|| anyhow!("[{}] option '{}' is required", section, key)),
    }
}

fn get_opt_str(ini: &Ini, section: &str, key: &str) -> Option<String> {
    ini.get(section, key)
}

fn get_float(ini: &Ini, section: &str, key: &str, default: Option<f64>) -> Result<f64> {
    match get_opt_float(ini, section, key)? {
        Some(v) => Ok(v),
        None => default.ok_or_else(|| anyhow!("[{}] option '{}' is required", section, key)),
    }
}

fn get_opt_float(ini: &Ini, section: &str, key: &str) -> Result<Option<f64>> {
    ini.getfloat(section, key)
        .map_err(|e| anyhow!("[{}] {}: {}", section, key, e))
}

fn get_bool(ini: &Ini, section: &str, key: &str, default: Option<bool>) -> Result<bool> {
    match ini
        .getbool(section, key)
        .map_err(|e| anyhow!("[{}] {}: {}", section, key, e))?
    {
        Some(v) => Ok(v),
        None => default.ok_or_else(|| anyhow!("[{}] option '{}' is required", section, key)),
    }
}
