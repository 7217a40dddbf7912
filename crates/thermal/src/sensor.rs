//! Temperature sensor models.

use crate::KELVIN_TO_CELSIUS;

/// Conversion between normalized ADC readings (0..1) and temperature in
/// Celsius.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sensor {
    /// Linear conversion chip (e.g. AD595): `T = adc * gain + offset`.
    Linear { gain: f64, offset: f64 },
    /// NTC thermistor in a pullup divider, modeled with Steinhart-Hart
    /// coefficients: `1/T_K = c1 + c2*ln(r) + c3*ln(r)^3`.
    Thermistor { c1: f64, c2: f64, c3: f64, pullup: f64 },
}

impl Sensor {
    /// Look up a named sensor. Linear chips scale their datasheet gain by
    /// the ADC reference voltage; thermistors take the board's pullup
    /// resistance.
    pub fn lookup(name: &str, adc_voltage: f64, pullup: f64) -> Option<Sensor> {
        match name {
            "EPCOS 100K B57560G104F" => Some(Sensor::Thermistor {
                c1: 0.000722136308968056,
                c2: 0.000216766566488498,
                c3: 8.92935804531095e-08,
                pullup,
            }),
            "ATC Semitec 104GT-2" => Some(Sensor::Thermistor {
                c1: 0.000809651054275124,
                c2: 0.000211636030735685,
                c3: 7.07420883993973e-08,
                pullup,
            }),
            "AD595" => Some(Sensor::Linear {
                gain: 300.0 / 3.022 * adc_voltage,
                offset: 0.,
            }),
            _ => None,
        }
    }

    pub fn calc_temp(&self, adc: f64) -> f64 {
        match *self {
            Sensor::Linear { gain, offset } => adc * gain + offset,
            Sensor::Thermistor { c1, c2, c3, pullup } => {
                let r = pullup * adc / (1. - adc);
                let ln_r = r.ln();
                let temp_inv = c1 + c2 * ln_r + c3 * ln_r.powi(3);
                1. / temp_inv + KELVIN_TO_CELSIUS
            }
        }
    }

    /// Inverse of [`Sensor::calc_temp`]; used to derive the ADC shutdown
    /// bounds. The thermistor branch solves the cubic in `ln(r)` exactly
    /// via its depressed form.
    pub fn calc_adc(&self, temp: f64) -> f64 {
        match *self {
            Sensor::Linear { gain, offset } => (temp - offset) / gain,
            Sensor::Thermistor { c1, c2, c3, pullup } => {
                let temp_inv = 1. / (temp - KELVIN_TO_CELSIUS);
                let y = (c1 - temp_inv) / (2. * c3);
                let x = ((c2 / (3. * c3)).powi(3) + y * y).sqrt();
                let r = ((x - y).cbrt() - (x + y).cbrt()).exp();
                r / (pullup + r)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    #[test]
    fn thermistor_inverse_round_trips() {
        let sensor = Sensor::lookup("EPCOS 100K B57560G104F", 5., 4700.).unwrap();
        let mut temp = 10.;
        while temp <= 250. {
            let adc = sensor.calc_adc(temp);
            assert!(adc > 0. && adc < 1., "adc {} out of range at {}", adc, temp);
            let back = sensor.calc_temp(adc);
            assert!(
                approx_eq!(f64, back, temp, epsilon = 1e-6),
                "{} -> {} -> {}",
                temp,
                adc,
                back
            );
            temp += 5.;
        }
    }

    #[test]
    fn thermistor_is_monotonic() {
        let sensor = Sensor::lookup("ATC Semitec 104GT-2", 5., 4700.).unwrap();
        // NTC: higher temperature means lower resistance, lower reading
        assert!(sensor.calc_adc(200.) < sensor.calc_adc(50.));
    }

    #[test]
    fn linear_sensor_scales_with_adc_voltage() {
        let sensor = Sensor::lookup("AD595", 5., 4700.).unwrap();
        let Sensor::Linear { gain, offset } = sensor else {
            panic!("AD595 should be linear");
        };
        assert_eq!(offset, 0.);
        assert!(approx_eq!(f64, gain, 300.0 / 3.022 * 5., epsilon = 1e-9));
        assert!(approx_eq!(
            f64,
            sensor.calc_temp(sensor.calc_adc(100.)),
            100.,
            epsilon = 1e-9
        ));
    }

    #[test]
    fn unknown_sensor_name() {
        assert!(Sensor::lookup("NTC 3950", 5., 4700.).is_none());
    }
}
