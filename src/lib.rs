//! An identifier/locator split overlay network.
//!
//! Nodes are named by a stable [`Nid`](identifier::Nid), and reached on one or more
//! [`Locator`](identifier::Locator)s. Every locator is an emulated broadcast link, backed by an
//! IPv6 multicast group. Since a node is not identified by where it is attached, it can move to
//! other locators while its peers keep talking to it.

use log::info;

pub mod config;
pub mod discovery;
pub mod forwarding;
pub mod identifier;
pub mod link;
pub mod locator_update;
pub mod mobility;
pub mod network;
pub mod packet;
pub mod queue;
pub mod session;
pub mod task;
pub mod transport;

use config::Config;
use identifier::Nid;
use link::{Link, LinkError};
use mobility::HandoverSettings;
use network::Network;
use task::TaskSet;
use transport::{BindError, Socket, Transport};

/// A running node. All background tasks of the node stop when it is dropped.
pub struct Node<L: Link> {
    network: Network<L>,
    transport: Transport<L>,
    _tasks: TaskSet,
}

impl<L: Link> Node<L> {
    /// Start a node on the given [`Link`] with the provided [`Config`]. The node joins the first
    /// locator set of the configured cycle, and starts moving if the cycle has more than one set.
    ///
    /// This must be called from within a tokio runtime.
    pub fn new(link: L, config: &Config) -> Result<Self, LinkError> {
        let nid = config.network.nid.unwrap_or_else(Nid::random);
        let cycle = config.network.locators.clone();

        let (network, mut tasks) = Network::new(
            link,
            nid,
            cycle.first().to_vec(),
            &config.network,
            &config.discovery,
        )?;
        let (transport, transport_tasks) =
            Transport::new(network.clone(), config.network.transport_header);
        tasks.extend(transport_tasks);

        if cycle.is_moving() {
            info!("Moving through {cycle} every {:?}", config.network.move_interval);
            tasks.spawn(
                "move",
                mobility::move_loop(
                    network.clone(),
                    cycle,
                    HandoverSettings::from(&config.network),
                ),
            );
        }

        Ok(Self {
            network,
            transport,
            _tasks: tasks,
        })
    }

    /// The identifier of this node.
    pub fn nid(&self) -> Nid {
        self.network.nid()
    }

    /// The network layer of this node.
    pub fn network(&self) -> &Network<L> {
        &self.network
    }

    /// The transport layer of this node.
    pub fn transport(&self) -> &Transport<L> {
        &self.transport
    }

    /// Bind a transport socket on this node.
    pub fn bind(&self, port: u16) -> Result<Socket<L>, BindError> {
        self.transport.bind(port)
    }
}
