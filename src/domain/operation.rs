//! Well-known operation types of the issuance backend.
//!
//! Operation types are free-form strings; these constants name the
//! state-mutating actions the backend routes through the pipeline.

/// Namespace for operation type identifiers.
pub struct OperationType;

impl OperationType {
    /// Deploy an ARC200 token contract.
    pub const DEPLOY_ARC200: &'static str = "token.deploy.arc200";

    /// Deploy an ARC3 (NFT) asset.
    pub const DEPLOY_ARC3: &'static str = "token.deploy.arc3";

    /// Deploy an ERC20 token contract.
    pub const DEPLOY_ERC20: &'static str = "token.deploy.erc20";

    /// Create or update compliance metadata for an asset.
    pub const COMPLIANCE_METADATA_UPSERT: &'static str = "compliance.metadata.upsert";

    /// Add an address to an asset whitelist.
    pub const WHITELIST_ADD: &'static str = "whitelist.entry.add";

    /// Remove an address from an asset whitelist.
    pub const WHITELIST_REMOVE: &'static str = "whitelist.entry.remove";

    /// All well-known operation types
    pub const ALL: &'static [&'static str] = &[
        Self::DEPLOY_ARC200,
        Self::DEPLOY_ARC3,
        Self::DEPLOY_ERC20,
        Self::COMPLIANCE_METADATA_UPSERT,
        Self::WHITELIST_ADD,
        Self::WHITELIST_REMOVE,
    ];

    /// Check whether an operation type is one of the well-known ones
    pub fn is_known(operation_type: &str) -> bool {
        Self::ALL.contains(&operation_type)
    }
}
