mod contact;
mod event;
mod event_participation;
mod session;
mod session_participation;

pub use contact::ContactShaper;
pub use event::EventShaper;
pub use event_participation::EventParticipationShaper;
pub use session::SessionShaper;
pub use session_participation::ParticipationShaper;

use std::collections::HashMap;
use std::sync::Arc;

use crate::application::shaper::Shaper;
use crate::domain::EntityType;
use crate::infrastructure::correlation::CorrelationGenerator;
use crate::infrastructure::crm::CrmClient;

/// One shaper per entity, all sharing the CRM client and the correlation
/// generator.
pub fn standard_set(
    crm: Arc<dyn CrmClient>,
    correlation: Arc<CorrelationGenerator>,
) -> HashMap<EntityType, Arc<dyn Shaper>> {
    let shapers: [Arc<dyn Shaper>; 5] = [
        Arc::new(ContactShaper::new(crm.clone(), correlation.clone())),
        Arc::new(EventShaper::new(crm.clone(), correlation.clone())),
        Arc::new(EventParticipationShaper::new(crm.clone())),
        Arc::new(SessionShaper::new(crm.clone(), correlation.clone())),
        Arc::new(ParticipationShaper::new(crm, correlation)),
    ];
    shapers
        .into_iter()
        .map(|shaper| (shaper.entity(), shaper))
        .collect()
}
