//! Element layer: the material-point local state and the auxiliary
//! element types sharing its node-contribution protocol (artificial
//! viscosity, hourglass control, tractions, body forces, surface flux,
//! two-body contact), plus the reference constitutive kernels the test
//! scenarios use.

pub mod constitutive;
pub mod contact;
pub mod hourglass;
pub mod loads;
pub mod material_point;
pub mod viscosity;

pub use contact::TwoBodyContact;
pub use hourglass::HourglassControl;
pub use loads::{BodyForce, SurfaceFlux, Traction};
pub use material_point::{MpData, MpLocalState, SupportEntry};
pub use viscosity::{ArtificialViscosity, ViscosityData, ViscosityMode};
