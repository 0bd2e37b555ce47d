use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Sub};

// ============================================================================
// Physical Unit Newtypes
// ============================================================================

/// Power in Watts (W)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Power(pub f64);

impl Power {
    pub fn watts(w: f64) -> Self {
        Self(w)
    }

    pub fn kilowatts(kw: f64) -> Self {
        Self(kw * 1000.0)
    }

    pub fn as_watts(&self) -> f64 {
        self.0
    }

    pub fn as_kilowatts(&self) -> f64 {
        self.0 / 1000.0
    }
}

impl std::fmt::Display for Power {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.abs() >= 1000.0 {
            write!(f, "{:.2} kW", self.as_kilowatts())
        } else {
            write!(f, "{:.1} W", self.0)
        }
    }
}

impl Add for Power {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Power {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

/// Energy in Watt-hours (Wh)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Energy(pub f64);

impl Energy {
    pub fn watt_hours(wh: f64) -> Self {
        Self(wh)
    }

    pub fn kilowatt_hours(kwh: f64) -> Self {
        Self(kwh * 1000.0)
    }

    pub fn as_watt_hours(&self) -> f64 {
        self.0
    }

    pub fn as_kilowatt_hours(&self) -> f64 {
        self.0 / 1000.0
    }
}

impl std::fmt::Display for Energy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.abs() >= 1000.0 {
            write!(f, "{:.2} kWh", self.as_kilowatt_hours())
        } else {
            write!(f, "{:.1} Wh", self.0)
        }
    }
}

impl Add for Energy {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Energy {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

/// Temperature in Celsius (°C)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Temperature(pub f64);

impl Temperature {
    pub fn celsius(c: f64) -> Self {
        Self(c)
    }

    pub fn as_celsius(&self) -> f64 {
        self.0
    }
}

impl std::fmt::Display for Temperature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1}\u{b0}C", self.0)
    }
}

/// Percentage (0-100%), used for state-of-charge values throughout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Percentage(pub f64);

impl Percentage {
    pub fn new(value: f64) -> Self {
        Self(value.clamp(0.0, 100.0))
    }

    pub fn from_ratio(ratio: f64) -> Self {
        Self((ratio * 100.0).clamp(0.0, 100.0))
    }

    pub fn as_percent(&self) -> f64 {
        self.0
    }

    pub fn as_ratio(&self) -> f64 {
        self.0 / 100.0
    }
}

impl std::fmt::Display for Percentage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.1}%", self.0)
    }
}

/// Price in EUR per kilowatt-hour. Residual corrections and price ceilings
/// are expressed in ct/kWh (hundredths of a euro); `Price` always stores
/// the EUR/kWh form and converts at the edges.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, PartialOrd)]
pub struct Price(pub f64);

impl Price {
    pub fn eur_per_kwh(price: f64) -> Self {
        Self(price)
    }

    pub fn ct_per_kwh(price: f64) -> Self {
        Self(price / 100.0)
    }

    pub fn as_eur_per_kwh(&self) -> f64 {
        self.0
    }

    pub fn as_ct_per_kwh(&self) -> f64 {
        self.0 * 100.0
    }
}

impl std::fmt::Display for Price {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2} EUR/kWh", self.0)
    }
}

impl Mul<Energy> for Price {
    type Output = f64; // cost in EUR
    fn mul(self, energy: Energy) -> Self::Output {
        self.0 * energy.as_kilowatt_hours()
    }
}

impl Add for Price {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Price {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_conversions() {
        let power = Power::kilowatts(5.0);
        assert_eq!(power.as_watts(), 5000.0);
        assert_eq!(power.as_kilowatts(), 5.0);

        let power2 = Power::watts(2500.0);
        assert_eq!(power2.as_kilowatts(), 2.5);
    }

    #[test]
    fn test_power_arithmetic() {
        let p1 = Power::kilowatts(3.0);
        let p2 = Power::kilowatts(2.0);

        let sum = p1 + p2;
        assert_eq!(sum.as_kilowatts(), 5.0);

        let diff = p1 - p2;
        assert_eq!(diff.as_kilowatts(), 1.0);
    }

    #[test]
    fn test_energy_conversions() {
        let energy = Energy::kilowatt_hours(10.0);
        assert_eq!(energy.as_watt_hours(), 10000.0);
        assert_eq!(energy.as_kilowatt_hours(), 10.0);
    }

    #[test]
    fn test_percentage_clamps() {
        let pct3 = Percentage::new(150.0);
        assert_eq!(pct3.as_percent(), 100.0);

        let pct4 = Percentage::new(-10.0);
        assert_eq!(pct4.as_percent(), 0.0);
    }

    #[test]
    fn test_price_ct_conversion() {
        let price = Price::eur_per_kwh(0.20);
        assert!((price.as_ct_per_kwh() - 20.0).abs() < 1e-9);

        let price2 = Price::ct_per_kwh(5.0);
        assert!((price2.as_eur_per_kwh() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_price_energy_multiplication() {
        let price = Price::eur_per_kwh(0.20);
        let energy = Energy::kilowatt_hours(10.0);
        let cost = price * energy;
        assert!((cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_serialization() {
        let power = Power::kilowatts(5.0);
        let json = serde_json::to_string(&power).unwrap();
        let deserialized: Power = serde_json::from_str(&json).unwrap();
        assert_eq!(power, deserialized);
    }
}
