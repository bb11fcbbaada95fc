//! Signature registry: the finite set of governance events ChainGov folds.
//!
//! Each [`Signature`] knows its canonical text, its topic hash, and the ABI
//! variants that share that canonical text. Variants differ only in parameter
//! names and `indexed` flags (ERC-20 vs ERC-721 `Transfer`, Compound `id` vs
//! OpenZeppelin `proposalId`), which is why a raw log needs [`Signature::select`]
//! before it can be decoded.

use alloy_json_abi::Event;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use tiny_keccak::{Hasher, Keccak};

use crate::config::{GovernorFamily, TokenKind};
use crate::error::SignatureError;

/// A supported governance event signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Signature {
    Transfer,
    DelegateChanged,
    DelegateChangedPartial,
    DelegateVotesChanged,
    ProposalCreated,
    ProposalCreatedWithType,
    ProposalCreatedModule,
    ProposalCreatedModuleNoType,
    ProposalQueued,
    ProposalExecuted,
    ProposalCanceled,
    VoteCast,
    VoteCastWithParams,
    ProposalTypeSet,
    ProposalTypeSetWithModule,
    ScopeCreated,
    ScopeDisabled,
    ScopeDeleted,
}

/// One ABI shape of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiVariant {
    /// Human-readable declaration, e.g. `event Transfer(address indexed from, ...)`.
    pub declaration: &'static str,
    /// Governor family this naming belongs to (`None` = any).
    pub family: Option<GovernorFamily>,
    /// Token kind this shape belongs to (`None` = any).
    pub token: Option<TokenKind>,
}

impl AbiVariant {
    /// The parsed declaration.
    pub fn event(&self) -> Result<&'static Event, SignatureError> {
        parsed(self.declaration)
    }
}

const fn any(declaration: &'static str) -> AbiVariant {
    AbiVariant { declaration, family: None, token: None }
}

const fn family(declaration: &'static str, family: GovernorFamily) -> AbiVariant {
    AbiVariant { declaration, family: Some(family), token: None }
}

const fn token(declaration: &'static str, token: TokenKind) -> AbiVariant {
    AbiVariant { declaration, family: None, token: Some(token) }
}

const TRANSFER: &[AbiVariant] = &[
    token("event Transfer(address indexed from, address indexed to, uint256 value)", TokenKind::Erc20),
    token("event Transfer(address indexed from, address indexed to, uint256 indexed tokenId)", TokenKind::Erc721),
];

const DELEGATE_CHANGED: &[AbiVariant] = &[any(
    "event DelegateChanged(address indexed delegator, address indexed fromDelegate, address indexed toDelegate)",
)];

const DELEGATE_CHANGED_PARTIAL: &[AbiVariant] = &[any(
    "event DelegateChanged(address indexed delegator, (address,uint96)[] oldDelegatees, (address,uint96)[] newDelegatees)",
)];

const DELEGATE_VOTES_CHANGED: &[AbiVariant] = &[any(
    "event DelegateVotesChanged(address indexed delegate, uint256 previousBalance, uint256 newBalance)",
)];

const PROPOSAL_CREATED: &[AbiVariant] = &[
    family(
        "event ProposalCreated(uint256 proposalId, address proposer, address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, uint256 voteStart, uint256 voteEnd, string description)",
        GovernorFamily::Oz,
    ),
    family(
        "event ProposalCreated(uint256 id, address proposer, address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, uint256 startBlock, uint256 endBlock, string description)",
        GovernorFamily::Compound,
    ),
    family(
        "event ProposalCreated(uint256 proposalId, address proposer, address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, uint256 startBlock, uint256 endBlock, string description)",
        GovernorFamily::Agora,
    ),
];

const PROPOSAL_CREATED_WITH_TYPE: &[AbiVariant] = &[any(
    "event ProposalCreated(uint256 proposalId, address proposer, address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, uint256 startBlock, uint256 endBlock, string description, uint8 proposalType)",
)];

const PROPOSAL_CREATED_MODULE: &[AbiVariant] = &[any(
    "event ProposalCreated(uint256 proposalId, address proposer, address votingModule, bytes proposalData, uint256 startBlock, uint256 endBlock, string description, uint8 proposalType)",
)];

const PROPOSAL_CREATED_MODULE_NO_TYPE: &[AbiVariant] = &[any(
    "event ProposalCreated(uint256 proposalId, address proposer, address votingModule, bytes proposalData, uint256 startBlock, uint256 endBlock, string description)",
)];

const PROPOSAL_QUEUED: &[AbiVariant] = &[
    family("event ProposalQueued(uint256 id, uint256 eta)", GovernorFamily::Compound),
    any("event ProposalQueued(uint256 proposalId, uint256 eta)"),
];

const PROPOSAL_EXECUTED: &[AbiVariant] = &[
    family("event ProposalExecuted(uint256 id)", GovernorFamily::Compound),
    any("event ProposalExecuted(uint256 proposalId)"),
];

const PROPOSAL_CANCELED: &[AbiVariant] = &[
    family("event ProposalCanceled(uint256 id)", GovernorFamily::Compound),
    any("event ProposalCanceled(uint256 proposalId)"),
];

const VOTE_CAST: &[AbiVariant] = &[
    family(
        "event VoteCast(address indexed voter, uint256 proposalId, uint8 support, uint256 votes, string reason)",
        GovernorFamily::Compound,
    ),
    any("event VoteCast(address indexed voter, uint256 proposalId, uint8 support, uint256 weight, string reason)"),
];

const VOTE_CAST_WITH_PARAMS: &[AbiVariant] = &[any(
    "event VoteCastWithParams(address indexed voter, uint256 proposalId, uint8 support, uint256 weight, string reason, bytes params)",
)];

const PROPOSAL_TYPE_SET: &[AbiVariant] = &[any(
    "event ProposalTypeSet(uint256 indexed proposalTypeId, uint16 quorum, uint16 approvalThreshold, string name)",
)];

const PROPOSAL_TYPE_SET_WITH_MODULE: &[AbiVariant] = &[any(
    "event ProposalTypeSet(uint8 indexed proposalTypeId, uint16 quorum, uint16 approvalThreshold, string name, string description, address indexed module)",
)];

const SCOPE_CREATED: &[AbiVariant] = &[any(
    "event ScopeCreated(uint8 indexed proposalTypeId, bytes24 indexed scopeKey, bytes encodedLimit, string description)",
)];

const SCOPE_DISABLED: &[AbiVariant] =
    &[any("event ScopeDisabled(uint8 indexed proposalTypeId, bytes24 indexed scopeKey)")];

const SCOPE_DELETED: &[AbiVariant] =
    &[any("event ScopeDeleted(uint8 indexed proposalTypeId, bytes24 indexed scopeKey)")];

impl Signature {
    pub const ALL: [Signature; 18] = [
        Signature::Transfer,
        Signature::DelegateChanged,
        Signature::DelegateChangedPartial,
        Signature::DelegateVotesChanged,
        Signature::ProposalCreated,
        Signature::ProposalCreatedWithType,
        Signature::ProposalCreatedModule,
        Signature::ProposalCreatedModuleNoType,
        Signature::ProposalQueued,
        Signature::ProposalExecuted,
        Signature::ProposalCanceled,
        Signature::VoteCast,
        Signature::VoteCastWithParams,
        Signature::ProposalTypeSet,
        Signature::ProposalTypeSetWithModule,
        Signature::ScopeCreated,
        Signature::ScopeDisabled,
        Signature::ScopeDeleted,
    ];

    /// Canonical signature text (the keccak preimage of topic0).
    pub fn as_str(&self) -> &'static str {
        match self {
            Signature::Transfer => "Transfer(address,address,uint256)",
            Signature::DelegateChanged => "DelegateChanged(address,address,address)",
            Signature::DelegateChangedPartial => {
                "DelegateChanged(address,(address,uint96)[],(address,uint96)[])"
            }
            Signature::DelegateVotesChanged => "DelegateVotesChanged(address,uint256,uint256)",
            Signature::ProposalCreated => {
                "ProposalCreated(uint256,address,address[],uint256[],string[],bytes[],uint256,uint256,string)"
            }
            Signature::ProposalCreatedWithType => {
                "ProposalCreated(uint256,address,address[],uint256[],string[],bytes[],uint256,uint256,string,uint8)"
            }
            Signature::ProposalCreatedModule => {
                "ProposalCreated(uint256,address,address,bytes,uint256,uint256,string,uint8)"
            }
            Signature::ProposalCreatedModuleNoType => {
                "ProposalCreated(uint256,address,address,bytes,uint256,uint256,string)"
            }
            Signature::ProposalQueued => "ProposalQueued(uint256,uint256)",
            Signature::ProposalExecuted => "ProposalExecuted(uint256)",
            Signature::ProposalCanceled => "ProposalCanceled(uint256)",
            Signature::VoteCast => "VoteCast(address,uint256,uint8,uint256,string)",
            Signature::VoteCastWithParams => {
                "VoteCastWithParams(address,uint256,uint8,uint256,string,bytes)"
            }
            Signature::ProposalTypeSet => "ProposalTypeSet(uint256,uint16,uint16,string)",
            Signature::ProposalTypeSetWithModule => {
                "ProposalTypeSet(uint8,uint16,uint16,string,string,address)"
            }
            Signature::ScopeCreated => "ScopeCreated(uint8,bytes24,bytes,string)",
            Signature::ScopeDisabled => "ScopeDisabled(uint8,bytes24)",
            Signature::ScopeDeleted => "ScopeDeleted(uint8,bytes24)",
        }
    }

    /// Database table holding rows of this event.
    pub fn table_name(&self) -> &'static str {
        match self {
            Signature::Transfer => "transfer",
            Signature::DelegateChanged => "delegate_changed",
            Signature::DelegateChangedPartial => "delegate_changed_partial",
            Signature::DelegateVotesChanged => "delegate_votes_changed",
            Signature::ProposalCreated => "proposal_created",
            Signature::ProposalCreatedWithType => "proposal_created_with_type",
            Signature::ProposalCreatedModule => "proposal_created_module",
            Signature::ProposalCreatedModuleNoType => "proposal_created_module_no_type",
            Signature::ProposalQueued => "proposal_queued",
            Signature::ProposalExecuted => "proposal_executed",
            Signature::ProposalCanceled => "proposal_canceled",
            Signature::VoteCast => "vote_cast",
            Signature::VoteCastWithParams => "vote_cast_with_params",
            Signature::ProposalTypeSet => "proposal_type_set",
            Signature::ProposalTypeSetWithModule => "proposal_type_set_with_module",
            Signature::ScopeCreated => "scope_created",
            Signature::ScopeDisabled => "scope_disabled",
            Signature::ScopeDeleted => "scope_deleted",
        }
    }

    /// keccak256 of the canonical text, lowercase `0x…`.
    pub fn sighash(&self) -> String {
        keccak256_hex(self.as_str())
    }

    /// Reverse lookup from a topic0 hash (any case, with or without `0x`).
    pub fn from_sighash(hash: &str) -> Option<Signature> {
        static BY_HASH: OnceLock<HashMap<String, Signature>> = OnceLock::new();
        let table = BY_HASH.get_or_init(|| {
            Signature::ALL.iter().map(|s| (s.sighash(), *s)).collect()
        });
        let hash = hash.trim().to_ascii_lowercase();
        let key = if hash.starts_with("0x") { hash } else { format!("0x{hash}") };
        table.get(&key).copied()
    }

    pub fn variants(&self) -> &'static [AbiVariant] {
        match self {
            Signature::Transfer => TRANSFER,
            Signature::DelegateChanged => DELEGATE_CHANGED,
            Signature::DelegateChangedPartial => DELEGATE_CHANGED_PARTIAL,
            Signature::DelegateVotesChanged => DELEGATE_VOTES_CHANGED,
            Signature::ProposalCreated => PROPOSAL_CREATED,
            Signature::ProposalCreatedWithType => PROPOSAL_CREATED_WITH_TYPE,
            Signature::ProposalCreatedModule => PROPOSAL_CREATED_MODULE,
            Signature::ProposalCreatedModuleNoType => PROPOSAL_CREATED_MODULE_NO_TYPE,
            Signature::ProposalQueued => PROPOSAL_QUEUED,
            Signature::ProposalExecuted => PROPOSAL_EXECUTED,
            Signature::ProposalCanceled => PROPOSAL_CANCELED,
            Signature::VoteCast => VOTE_CAST,
            Signature::VoteCastWithParams => VOTE_CAST_WITH_PARAMS,
            Signature::ProposalTypeSet => PROPOSAL_TYPE_SET,
            Signature::ProposalTypeSetWithModule => PROPOSAL_TYPE_SET_WITH_MODULE,
            Signature::ScopeCreated => SCOPE_CREATED,
            Signature::ScopeDisabled => SCOPE_DISABLED,
            Signature::ScopeDeleted => SCOPE_DELETED,
        }
    }

    pub fn is_proposal_created(&self) -> bool {
        matches!(
            self,
            Signature::ProposalCreated
                | Signature::ProposalCreatedWithType
                | Signature::ProposalCreatedModule
                | Signature::ProposalCreatedModuleNoType
        )
    }

    /// Pick the ABI variant a raw event matches.
    ///
    /// `indexed` is the number of indexed topics (topics minus topic0) when the
    /// source carries topics; text sources pass `None` and select on
    /// deployment metadata alone.
    pub fn select(
        &self,
        indexed: Option<usize>,
        governor: GovernorFamily,
        token_kind: TokenKind,
    ) -> Result<(&'static AbiVariant, &'static Event), SignatureError> {
        let mut candidates = Vec::new();
        for variant in self.variants() {
            let event = parsed(variant.declaration)?;
            let indexed_count = event.inputs.iter().filter(|p| p.indexed).count();
            if indexed.map_or(true, |n| n == indexed_count) {
                candidates.push((variant, event));
            }
        }
        if candidates.is_empty() {
            return Err(SignatureError::NoVariant {
                signature: self.as_str().to_string(),
                topics: indexed.unwrap_or(0) + 1,
            });
        }
        let rank = |v: &AbiVariant| {
            let token_rank = match v.token {
                Some(t) if t == token_kind => 0,
                None => 1,
                Some(_) => 2,
            };
            let family_rank = match v.family {
                Some(f) if f == governor => 0,
                None => 1,
                Some(_) => 2,
            };
            (token_rank, family_rank)
        };
        candidates.sort_by_key(|(v, _)| rank(v));
        Ok(candidates[0])
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        Signature::ALL
            .iter()
            .copied()
            .find(|sig| sig.as_str() == wanted)
            .ok_or_else(|| SignatureError::Unknown(s.to_string()))
    }
}

impl From<Signature> for String {
    fn from(sig: Signature) -> Self {
        sig.as_str().to_string()
    }
}

impl TryFrom<String> for Signature {
    type Error = SignatureError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Compute keccak256 of a string, rendered as lowercase `0x…` hex.
pub fn keccak256_hex(input: &str) -> String {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(input.as_bytes());
    hasher.finalize(&mut output);
    format!("0x{}", hex::encode(output))
}

/// Parsed ABI declarations, built once.
fn parsed(declaration: &'static str) -> Result<&'static Event, SignatureError> {
    static CACHE: OnceLock<HashMap<&'static str, Result<Event, String>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| {
        Signature::ALL
            .iter()
            .flat_map(|sig| sig.variants().iter())
            .map(|v| (v.declaration, Event::parse(v.declaration).map_err(|e| e.to_string())))
            .collect()
    });
    match cache.get(declaration) {
        Some(Ok(event)) => Ok(event),
        Some(Err(reason)) => Err(SignatureError::InvalidAbi {
            declaration: declaration.to_string(),
            reason: reason.clone(),
        }),
        None => Err(SignatureError::InvalidAbi {
            declaration: declaration.to_string(),
            reason: "not registered".into(),
        }),
    }
}
