//! Core identifier, tag, and status types.

/// Global node (degree-of-freedom) identifier, unique across ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u64);

/// Global material-point identifier, unique across ranks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MpId(pub u64);

/// A named group of nodes belonging to one body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CarrierId(pub u32);

/// Rank index within the distributed run.
pub type Rank = usize;

/// Outcome of driving the model forward, surfaced to the driver layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepStatus {
    StepTaken,
    EndOfSimulation,
    StepCountExceeded,
}

/// Intra-rank scheduling flavor for assembly reductions.
///
/// Both flavors produce identical results up to floating-point summation
/// order; `Deterministic` fixes that order so repeated runs are
/// bitwise equal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Threading {
    Deterministic,
    #[default]
    WorkStealing,
}

/// Energy-release-rate mode selected by the stress state during the
/// fracture scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReleaseRateMode {
    TensileI,
    ShearII,
    ShearIII,
    Vaporization,
    Damage,
}

/// Field selector for quadrature-point and nodal data extraction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldTag {
    EffectiveStress,
    EffectiveStrain,
    Temperature,
    MeanStress,
    Velocity,
    Displacement,
    Status,
    Jacobian,
    J3,
    DeformationGradient,
    VoidFraction,
    Rotation,
    Orientation,
    Gamma,
    Weight,
    CauchyStress,
    TrueStrain,
    EnergyReleaseRate,
    DissipatedEnergy,
    Vorticity,
    Mass,
    AvStress,
    AvDeformation,
}
