//! Price calculation for handmade goods.
//!
//! The engine turns six inputs into a price breakdown in four steps: base cost
//! (materials plus labor), uniqueness and demand adjustments around a neutral
//! rating of 5, a margin gross-up, and economy/premium variants.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Rating treated as "average" for uniqueness and demand.
const NEUTRAL_RATING: f64 = 5.0;
const MIN_RATING: f64 = 1.0;
const MAX_RATING: f64 = 10.0;

/// The six pricing factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingField {
    MaterialCost,
    HoursWorked,
    LaborRate,
    Uniqueness,
    Demand,
    ProfitMargin,
}

impl PricingField {
    pub const ALL: [PricingField; 6] = [
        PricingField::MaterialCost,
        PricingField::HoursWorked,
        PricingField::LaborRate,
        PricingField::Uniqueness,
        PricingField::Demand,
        PricingField::ProfitMargin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PricingField::MaterialCost => "material_cost",
            PricingField::HoursWorked => "hours_worked",
            PricingField::LaborRate => "labor_rate",
            PricingField::Uniqueness => "uniqueness",
            PricingField::Demand => "demand",
            PricingField::ProfitMargin => "profit_margin",
        }
    }

    /// Human-readable description, also fed to the extraction prompt.
    pub fn description(&self) -> &'static str {
        match self {
            PricingField::MaterialCost => "Total cost of materials in dollars",
            PricingField::HoursWorked => "Number of hours spent creating the product",
            PricingField::LaborRate => "Hourly labor rate in dollars",
            PricingField::Uniqueness => {
                "Uniqueness on a 1-10 scale (1 = common, 10 = one-of-a-kind)"
            }
            PricingField::Demand => "Market demand on a 1-10 scale (1 = low, 10 = high)",
            PricingField::ProfitMargin => {
                "Target profit margin as a fraction of the retail price, from 0 up to (not including) 1"
            }
        }
    }
}

impl fmt::Display for PricingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingInputs {
    pub material_cost: f64,
    pub hours_worked: f64,
    pub labor_rate: f64,
    pub uniqueness: f64,
    pub demand: f64,
    pub profit_margin: f64,
}

impl PricingInputs {
    /// Checks every field against its domain, reporting the first violation.
    pub fn validate(&self) -> Result<()> {
        non_negative(PricingField::MaterialCost, self.material_cost)?;
        non_negative(PricingField::HoursWorked, self.hours_worked)?;
        non_negative(PricingField::LaborRate, self.labor_rate)?;
        rating(PricingField::Uniqueness, self.uniqueness)?;
        rating(PricingField::Demand, self.demand)?;

        let margin = self.profit_margin;
        finite(PricingField::ProfitMargin, margin)?;
        if !(0.0..1.0).contains(&margin) {
            return Err(Error::invalid(
                PricingField::ProfitMargin.as_str(),
                format!("must be at least 0 and below 1, got {margin}"),
            ));
        }
        Ok(())
    }
}

fn finite(field: PricingField, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::invalid(field.as_str(), "must be a finite number"))
    }
}

fn non_negative(field: PricingField, value: f64) -> Result<()> {
    finite(field, value)?;
    if value < 0.0 {
        return Err(Error::invalid(
            field.as_str(),
            format!("must not be negative, got {value}"),
        ));
    }
    Ok(())
}

fn rating(field: PricingField, value: f64) -> Result<()> {
    finite(field, value)?;
    if !(MIN_RATING..=MAX_RATING).contains(&value) {
        return Err(Error::invalid(
            field.as_str(),
            format!("must be between {MIN_RATING} and {MAX_RATING}, got {value}"),
        ));
    }
    Ok(())
}

/// Tunable constants of the formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingWeights {
    /// Fraction of base price added per uniqueness point above 5.
    pub uniqueness_weight: f64,
    /// Fraction of base price added per demand point above 5.
    pub demand_weight: f64,
    pub economy_modifier: f64,
    pub premium_modifier: f64,
}

impl Default for PricingWeights {
    fn default() -> Self {
        Self {
            uniqueness_weight: 0.05,
            demand_weight: 0.04,
            economy_modifier: 0.85,
            premium_modifier: 1.25,
        }
    }
}

impl PricingWeights {
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("uniqueness_weight", self.uniqueness_weight),
            ("demand_weight", self.demand_weight),
        ];
        for (name, value) in checks {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        // A weight this large lets a rating of 1 push the adjusted price below zero.
        let worst_case = 1.0 - (NEUTRAL_RATING - MIN_RATING) * (self.uniqueness_weight + self.demand_weight);
        if worst_case <= 0.0 {
            return Err(Error::Config(format!(
                "uniqueness_weight + demand_weight must be below {}",
                1.0 / (NEUTRAL_RATING - MIN_RATING)
            )));
        }
        let modifiers = [
            ("economy_modifier", self.economy_modifier),
            ("premium_modifier", self.premium_modifier),
        ];
        for (name, value) in modifiers {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::Config(format!(
                    "{name} must be a positive number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingResult {
    pub labor_cost: f64,
    pub base_price: f64,
    pub uniqueness_adjustment: f64,
    pub demand_adjustment: f64,
    pub adjusted_price: f64,
    pub final_price: f64,
    pub economy_price: f64,
    pub premium_price: f64,
    /// `final_price - adjusted_price`.
    pub profit_amount: f64,
    /// Profit as a percentage of the adjusted cost.
    pub markup_percent: f64,
}

impl fmt::Display for PricingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Labor cost:            ${:.2}", self.labor_cost)?;
        writeln!(f, "Base price:            ${:.2}", self.base_price)?;
        writeln!(f, "Uniqueness adjustment: ${:.2}", self.uniqueness_adjustment)?;
        writeln!(f, "Demand adjustment:     ${:.2}", self.demand_adjustment)?;
        writeln!(f, "Adjusted price:        ${:.2}", self.adjusted_price)?;
        writeln!(f, "Recommended price:     ${:.2}", self.final_price)?;
        writeln!(f, "Economy price:         ${:.2}", self.economy_price)?;
        writeln!(f, "Premium price:         ${:.2}", self.premium_price)?;
        writeln!(f, "Profit:                ${:.2}", self.profit_amount)?;
        write!(f, "Markup:                {:.2}%", self.markup_percent)
    }
}

/// Stateless calculator; cheap to clone and safe to share between sessions.
/// Weights are validated on construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct PricingEngine {
    weights: PricingWeights,
}

impl PricingEngine {
    pub fn new(weights: PricingWeights) -> Result<Self> {
        weights.validate()?;
        Ok(Self { weights })
    }

    pub fn weights(&self) -> &PricingWeights {
        &self.weights
    }

    pub fn compute(&self, inputs: &PricingInputs) -> Result<PricingResult> {
        inputs.validate()?;
        let w = &self.weights;

        let labor_cost = inputs.hours_worked * inputs.labor_rate;
        let base_price = inputs.material_cost + labor_cost;
        let uniqueness_adjustment =
            base_price * (inputs.uniqueness - NEUTRAL_RATING) * w.uniqueness_weight;
        let demand_adjustment = base_price * (inputs.demand - NEUTRAL_RATING) * w.demand_weight;
        let adjusted_price = base_price + uniqueness_adjustment + demand_adjustment;
        let final_price = adjusted_price / (1.0 - inputs.profit_margin);

        let profit_amount = final_price - adjusted_price;
        let markup_percent = if adjusted_price > 0.0 {
            profit_amount / adjusted_price * 100.0
        } else {
            0.0
        };

        let result = PricingResult {
            labor_cost,
            base_price,
            uniqueness_adjustment,
            demand_adjustment,
            adjusted_price,
            final_price,
            economy_price: final_price * w.economy_modifier,
            premium_price: final_price * w.premium_modifier,
            profit_amount,
            markup_percent,
        };

        if !result.final_price.is_finite() {
            return Err(Error::invalid(
                PricingField::MaterialCost.as_str(),
                "inputs are too large to price",
            ));
        }
        Ok(result)
    }
}
