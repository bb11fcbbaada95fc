//! Build products, the dispatch table and clients from a deployment descriptor.

use serde_json::json;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

use chaingov_codec::Normalizer;
use chaingov_core::{ChainDeployment, DeploymentConfig, GovernorFamily, Signature, StreamKey};
use chaingov_products::{
    share, Balances, DataProduct, Delegations, ParticipationRate, ProposalTypes, Proposals,
    SharedProduct, Votes,
};
use chaingov_sources::rpc::HttpTransport;
use chaingov_sources::{
    ArchiveClient, DatabaseClient, FeedClient, HistoricalClient, Paging, RealtimeClient,
};

use crate::dispatch::DispatchTable;
use crate::error::FeedError;
use crate::feed::{BatchHook, EventFeed};

/// The data products of one DAO on one chain.
pub struct Governance {
    pub chain_id: u64,
    pub balances: Option<Arc<RwLock<Balances>>>,
    pub delegations: Option<Arc<RwLock<Delegations>>>,
    pub proposals: Option<Arc<RwLock<Proposals>>>,
    pub votes: Option<Arc<RwLock<Votes>>>,
    pub proposal_types: Option<Arc<RwLock<ProposalTypes>>>,
    pub participation: Arc<RwLock<ParticipationRate>>,
    routes: Vec<(StreamKey, SharedProduct)>,
}

impl Governance {
    pub fn for_chain(chain: &ChainDeployment) -> Self {
        let id = chain.chain_id;
        let mut routes: Vec<(StreamKey, SharedProduct)> = Vec::new();
        let mut gov = Governance {
            chain_id: id,
            balances: None,
            delegations: None,
            proposals: None,
            votes: None,
            proposal_types: None,
            participation: Arc::new(RwLock::new(ParticipationRate::new())),
            routes: Vec::new(),
        };

        if let Some(token) = &chain.token {
            let mut balances = Balances::new(token.kind);
            if let Some(field) = &token.value_field {
                balances = balances.with_value_field(field.clone());
            }
            let balances = share(balances);
            routes.push((StreamKey::log(id, &token.address, Signature::Transfer), shared(&balances)));

            let delegations = share(Delegations::new(token.partial_delegation));
            let changed = if token.partial_delegation {
                Signature::DelegateChangedPartial
            } else {
                Signature::DelegateChanged
            };
            routes.push((StreamKey::blocks(id), shared(&delegations)));
            routes.push((StreamKey::log(id, &token.address, changed), shared(&delegations)));
            routes.push((
                StreamKey::log(id, &token.address, Signature::DelegateVotesChanged),
                shared(&delegations),
            ));
            gov.balances = Some(balances);
            gov.delegations = Some(delegations);
        }

        if let Some(governor) = &chain.governor {
            let proposals = share(Proposals::new(governor.family, chain.modules.clone()));
            let votes = share(Votes::new());
            routes.push((StreamKey::blocks(id), shared(&proposals)));
            for signature in proposal_signatures(governor.family) {
                routes.push((StreamKey::log(id, &governor.address, *signature), shared(&proposals)));
            }
            for signature in vote_signatures(governor.family) {
                routes.push((StreamKey::log(id, &governor.address, *signature), shared(&votes)));
            }
            gov.proposals = Some(proposals);
            gov.votes = Some(votes);
        }

        if let Some(types) = &chain.proposal_types {
            let product = share(ProposalTypes::new());
            for signature in TYPE_SIGNATURES {
                routes.push((StreamKey::log(id, &types.address, *signature), shared(&product)));
            }
            gov.proposal_types = Some(product);
        }

        gov.routes = routes;
        gov
    }

    /// Subscribe every product to its streams.
    pub fn register(&self, table: &mut DispatchTable) {
        for (stream, product) in &self.routes {
            table.register(stream.clone(), Arc::clone(product));
        }
    }

    pub fn streams(&self) -> Vec<StreamKey> {
        let mut out: Vec<StreamKey> = self.routes.iter().map(|(k, _)| k.clone()).collect();
        out.sort();
        out.dedup();
        out
    }

    /// Recompute participation if the proposal tracker changed. Needs a
    /// token and a governor on this chain.
    pub fn refresh_participation(&self) -> bool {
        let (Some(proposals), Some(delegations), Some(votes)) =
            (&self.proposals, &self.delegations, &self.votes)
        else {
            return false;
        };
        let mut proposals = proposals.write().unwrap_or_else(PoisonError::into_inner);
        let delegations = delegations.read().unwrap_or_else(PoisonError::into_inner);
        let votes = votes.read().unwrap_or_else(PoisonError::into_inner);
        self.participation
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh(&mut proposals, &delegations, &votes)
    }

    /// Per-product summaries.
    pub fn summary(&self) -> serde_json::Value {
        fn read<P: DataProduct>(p: &Option<Arc<RwLock<P>>>) -> serde_json::Value {
            p.as_ref().map_or(serde_json::Value::Null, |p| {
                p.read().unwrap_or_else(PoisonError::into_inner).summary()
            })
        }
        let refreshes = self
            .participation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .refreshes();
        json!({
            "chain_id": self.chain_id,
            "balances": read(&self.balances),
            "delegations": read(&self.delegations),
            "proposals": read(&self.proposals),
            "votes": read(&self.votes),
            "proposal_types": read(&self.proposal_types),
            "participation_refreshes": refreshes,
        })
    }
}

impl BatchHook for Governance {
    fn after_batch(&self) {
        self.refresh_participation();
    }
}

fn proposal_signatures(family: GovernorFamily) -> &'static [Signature] {
    match family {
        GovernorFamily::Agora => &[
            Signature::ProposalCreated,
            Signature::ProposalCreatedWithType,
            Signature::ProposalCreatedModule,
            Signature::ProposalCreatedModuleNoType,
            Signature::ProposalQueued,
            Signature::ProposalExecuted,
            Signature::ProposalCanceled,
        ],
        GovernorFamily::Oz | GovernorFamily::Compound => &[
            Signature::ProposalCreated,
            Signature::ProposalQueued,
            Signature::ProposalExecuted,
            Signature::ProposalCanceled,
        ],
    }
}

fn vote_signatures(family: GovernorFamily) -> &'static [Signature] {
    match family {
        GovernorFamily::Compound => &[Signature::VoteCast],
        GovernorFamily::Oz | GovernorFamily::Agora => {
            &[Signature::VoteCast, Signature::VoteCastWithParams]
        }
    }
}

fn shared<P: DataProduct + 'static>(product: &Arc<RwLock<P>>) -> SharedProduct {
    product.clone()
}

const TYPE_SIGNATURES: &[Signature] = &[
    Signature::ProposalTypeSet,
    Signature::ProposalTypeSetWithModule,
    Signature::ScopeCreated,
    Signature::ScopeDisabled,
    Signature::ScopeDeleted,
];

// ─── Deployment ───────────────────────────────────────────────────────────────

/// A fully wired feed plus typed handles to every chain's products.
pub struct Deployment {
    pub feed: EventFeed,
    pub chains: Vec<Arc<Governance>>,
}

impl Deployment {
    pub fn governance(&self, chain_id: u64) -> Option<&Governance> {
        self.chains.iter().find(|g| g.chain_id == chain_id).map(Arc::as_ref)
    }
}

/// The clients `config.feed` asks for, for one chain.
pub fn clients_for(config: &DeploymentConfig, chain: &ChainDeployment) -> Result<Vec<Box<dyn FeedClient>>, FeedError> {
    let normalizer = Normalizer::for_chain(chain);
    let mut clients: Vec<Box<dyn FeedClient>> = Vec::new();

    if let Some(archive) = &config.feed.archive {
        clients.push(Box::new(ArchiveClient::new(&archive.dir, normalizer)));
    }
    if let Some(rpc) = &config.feed.rpc {
        let transport = HttpTransport::new(rpc).map_err(|e| FeedError::Client {
            client: format!("rpc:{}", rpc.url),
            source: e.into(),
        })?;
        let paging = Paging::for_chain(rpc, chain.chain_id);
        clients.push(Box::new(HistoricalClient::new(transport, normalizer, paging)));
    }
    if let Some(db) = &config.feed.database {
        let client = DatabaseClient::new(db, normalizer).map_err(|source| FeedError::Client {
            client: "postgres".into(),
            source,
        })?;
        clients.push(Box::new(client));
    }
    if let Some(ws) = &config.feed.ws {
        clients.push(Box::new(RealtimeClient::new(ws, normalizer)));
    }
    Ok(clients)
}

/// Products, dispatch table, hooks and clients for every configured chain.
pub fn build(config: &DeploymentConfig) -> Result<Deployment, FeedError> {
    let chains: Vec<Arc<Governance>> = config
        .chains
        .iter()
        .map(|c| Arc::new(Governance::for_chain(c)))
        .collect();

    let mut table = DispatchTable::new();
    for gov in &chains {
        gov.register(&mut table);
    }
    info!(chains = chains.len(), streams = table.len(), "dispatch table built");

    let mut feed = EventFeed::new(table);
    for gov in &chains {
        feed.add_hook(Arc::clone(gov) as Arc<dyn BatchHook>)?;
    }
    for chain in &config.chains {
        for client in clients_for(config, chain)? {
            feed.add_client(client, chain.chain_id)?;
        }
    }
    Ok(Deployment { feed, chains })
}
