//! Onboarding bootstrap — seeds a development tenant with a minimal catalog
//! and generates synthetic usage events against it.

pub mod bootstrap;
pub mod generator;

pub use bootstrap::OnboardingBootstrap;
pub use generator::EventGenerator;
