use crate::{
    candles::DEFAULT_MAX_PRECISION,
    error::{IndexerError, IndexerResult},
    resolution::ResolutionSet,
};

pub const DEFAULT_AMM_CONTRACT: &str = "con_rocketswap_official_v1_1";
pub const DEFAULT_RESOLUTIONS: &[&str] = &["15m", "1h", "1d", "1w"];
pub const DEFAULT_HISTORY_PAGE_SIZE: usize = 1000;

/// Display precision is stored as a postgres INTEGER and rendered by charts.
const MAX_PRECISION_LIMIT: i32 = 30;

/// Validated settings consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub amm_contract: String,
    pub resolutions: ResolutionSet,
    pub max_precision: i32,
    pub history_page_size: usize,
}

impl IndexerConfig {
    pub fn new<S: AsRef<str>>(
        amm_contract: &str,
        resolutions: &[S],
        max_precision: i32,
        history_page_size: usize,
    ) -> IndexerResult<Self> {
        let amm_contract = amm_contract.trim();
        if amm_contract.is_empty() || amm_contract.contains(['.', ':']) {
            return Err(IndexerError::malformed(format!(
                "invalid AMM contract name '{amm_contract}'"
            )));
        }
        if !(0..=MAX_PRECISION_LIMIT).contains(&max_precision) {
            return Err(IndexerError::malformed(format!(
                "max precision must be between 0 and {MAX_PRECISION_LIMIT}, got {max_precision}"
            )));
        }
        if history_page_size == 0 {
            return Err(IndexerError::malformed("history page size must be positive"));
        }

        Ok(Self {
            amm_contract: amm_contract.to_string(),
            resolutions: ResolutionSet::parse(resolutions)?,
            max_precision,
            history_page_size,
        })
    }
}
