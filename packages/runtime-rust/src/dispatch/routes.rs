//! Role decision tables for messages arriving on a shared endpoint.
//!
//! Built once, then only read. `inbound` answers "which role receives this
//! message", `transmit_error` answers "which role sent the message that
//! failed", which is the role that would have received its reply.

use std::collections::HashMap;
use std::sync::OnceLock;

use courier_core::{stage, InteractionType, MessageHeader, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InboundKey {
    interaction: InteractionType,
    stage: u8,
    is_error: bool,
}

#[derive(Debug, Clone)]
pub struct RouteTable {
    inbound: HashMap<InboundKey, Role>,
    transmit: HashMap<(InteractionType, u8), Role>,
}

impl RouteTable {
    #[must_use]
    pub fn build() -> Self {
        let mut inbound = HashMap::new();
        let mut transmit = HashMap::new();

        for interaction in InteractionType::ALL {
            for &s in interaction.stages() {
                for is_error in [false, true] {
                    inbound.insert(
                        InboundKey {
                            interaction,
                            stage: s,
                            is_error,
                        },
                        receiver_of(interaction, s, is_error),
                    );
                }
                transmit.insert((interaction, s), sender_of(interaction, s));
            }
        }

        Self { inbound, transmit }
    }

    /// Role that receives `header`'s message, or `None` for a stage the
    /// pattern does not have.
    #[must_use]
    pub fn inbound(&self, header: &MessageHeader) -> Option<Role> {
        self.inbound
            .get(&InboundKey {
                interaction: header.interaction_type,
                stage: header.stage,
                is_error: header.is_error,
            })
            .copied()
    }

    /// Role that sent the message whose delivery failed.
    #[must_use]
    pub fn transmit_error(&self, header: &MessageHeader) -> Option<Role> {
        self.transmit
            .get(&(header.interaction_type, header.stage))
            .copied()
    }

    /// Number of inbound decisions held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inbound.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inbound.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::build()
    }
}

/// The process-wide table.
pub fn shared() -> &'static RouteTable {
    static TABLE: OnceLock<RouteTable> = OnceLock::new();
    TABLE.get_or_init(RouteTable::build)
}

fn receiver_of(interaction: InteractionType, s: u8, is_error: bool) -> Role {
    if interaction != InteractionType::PubSub {
        return if s == 1 { Role::Provider } else { Role::Consumer };
    }
    match s {
        stage::REGISTER
        | stage::DEREGISTER
        | stage::PUBLISH_REGISTER
        | stage::PUBLISH_DEREGISTER => Role::Broker,
        stage::PUBLISH if is_error => Role::Provider,
        stage::PUBLISH => Role::Broker,
        stage::PUBLISH_REGISTER_ACK | stage::PUBLISH_DEREGISTER_ACK => Role::Provider,
        // REGISTER_ACK, DEREGISTER_ACK, NOTIFY
        _ => Role::Consumer,
    }
}

fn sender_of(interaction: InteractionType, s: u8) -> Role {
    if interaction != InteractionType::PubSub {
        return if s == 1 { Role::Consumer } else { Role::Provider };
    }
    match s {
        stage::REGISTER | stage::DEREGISTER => Role::Consumer,
        stage::PUBLISH_REGISTER | stage::PUBLISH | stage::PUBLISH_DEREGISTER => Role::Provider,
        _ => Role::Broker,
    }
}
