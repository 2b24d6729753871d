use forge_core::DomainEvent;

/// Predicate applied to every event before it enters the pipeline.
pub trait EventFilter: Send + Sync {
    fn accept(&self, event: &DomainEvent) -> bool;
}

impl<F> EventFilter for F
where
    F: Fn(&DomainEvent) -> bool + Send + Sync,
{
    fn accept(&self, event: &DomainEvent) -> bool {
        self(event)
    }
}

/// Rejects events whose source starts with one of the excluded prefixes.
///
/// The default excludes the pipeline itself and the gateway's broadcast path,
/// so logging about log delivery never feeds back into the log channel.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    excluded: Vec<String>,
}

impl SourceFilter {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            excluded: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn excludes(&self, source: &str) -> bool {
        self.excluded.iter().any(|p| source.starts_with(p.as_str()))
    }
}

impl Default for SourceFilter {
    fn default() -> Self {
        Self::new(["forge_pipeline", "forge_gateway::broadcast"])
    }
}

impl EventFilter for SourceFilter {
    fn accept(&self, event: &DomainEvent) -> bool {
        !self.excludes(&event.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::EventLevel;

    #[test]
    fn default_filter_drops_meta_logging() {
        let f = SourceFilter::default();
        let meta = DomainEvent::new(EventLevel::Info, "forge_pipeline::pipeline", "flushed");
        let fanout = DomainEvent::new(EventLevel::Debug, "forge_gateway::broadcast", "sent");
        let app = DomainEvent::new(EventLevel::Info, "forge_registry::registry", "registered");

        assert!(!f.accept(&meta));
        assert!(!f.accept(&fanout));
        assert!(f.accept(&app));
    }

    #[test]
    fn closures_are_filters() {
        let only_errors = |e: &DomainEvent| e.level >= EventLevel::Error;
        assert!(!only_errors.accept(&DomainEvent::new(EventLevel::Info, "x", "y")));
        assert!(only_errors.accept(&DomainEvent::new(EventLevel::Fatal, "x", "y")));
    }
}
