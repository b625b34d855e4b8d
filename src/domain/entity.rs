/// Domain entities tracked by the bridge. One CDC channel, one set of
/// routing targets and one inbound reconciler exist per entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Contact,
    Event,
    EventParticipation,
    Session,
    SessionParticipation,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Contact,
        EntityType::Event,
        EntityType::EventParticipation,
        EntityType::Session,
        EntityType::SessionParticipation,
    ];

    /// CRM object name used for record-store operations.
    pub fn object_name(&self) -> &'static str {
        match self {
            EntityType::Contact => "Contact",
            EntityType::Event => "Event",
            EntityType::EventParticipation => "EventParticipation",
            EntityType::Session => "Session",
            EntityType::SessionParticipation => "SessionParticipation",
        }
    }

    /// Entity segment used in exchange names and routing keys. Contacts are
    /// exposed to downstream services as "user"; participation changes ride
    /// on their parent's exchange.
    pub fn wire_name(&self) -> &'static str {
        match self {
            EntityType::Contact => "user",
            EntityType::Event | EntityType::EventParticipation => "event",
            EntityType::Session | EntityType::SessionParticipation => "session",
        }
    }

    /// CDC notification channel the dispatcher subscribes to.
    pub fn cdc_channel(&self) -> &'static str {
        match self {
            EntityType::Contact => "cdc_contact",
            EntityType::Event => "cdc_event",
            EntityType::EventParticipation => "cdc_event_participation",
            EntityType::Session => "cdc_session",
            EntityType::SessionParticipation => "cdc_session_participation",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.object_name())
    }
}
