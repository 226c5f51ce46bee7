pub mod enroll;
pub mod reconcile;
pub mod router;
pub mod server;
pub mod session;

pub use enroll::{EnrollmentController, PendingEnrollment, ShotOutcome};
pub use reconcile::Reconciler;
pub use router::Router;
pub use server::Server;
pub use session::{SessionHandle, SessionRegistry, SessionRole};
