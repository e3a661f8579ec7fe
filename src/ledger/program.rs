use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
};

use crate::{
    error::{AppResult, FailureKind, LedgerError, ValidationError},
    ledger::{
        client::{AccountFilter, AccountSnapshot},
        models::{HeirAllocation, InheritanceRecord, RecordId, RecordKind},
    },
};

pub const INHERITANCE_SEED: &[u8] = b"inheritance";
pub const TOKEN_INHERITANCE_SEED: &[u8] = b"token_inheritance";
pub const SMART_WALLET_SEED: &[u8] = b"smart_wallet";

/// Program error codes surfaced in failed transactions
pub const ERROR_UNAUTHORIZED: u32 = 6000;
pub const ERROR_ALREADY_EXECUTED: u32 = 6001;
pub const ERROR_NOT_YET_INACTIVE: u32 = 6002;
pub const ERROR_INVALID_ALLOCATION: u32 = 6003;

/// How a program error code is treated by the keeper
pub fn failure_kind(code: u32) -> Option<FailureKind> {
    match code {
        ERROR_UNAUTHORIZED => Some(FailureKind::AuthorizationRejected),
        ERROR_ALREADY_EXECUTED => Some(FailureKind::AlreadyExecuted),
        // clock skew between keeper and cluster; try again next cycle
        ERROR_NOT_YET_INACTIVE => Some(FailureKind::Rejected),
        ERROR_INVALID_ALLOCATION => Some(FailureKind::InvalidRecord),
        _ => None,
    }
}

const DISCRIMINATOR_LEN: usize = 8;

// Rent parameters of the cluster (lamports per byte-year * exemption threshold)
const ACCOUNT_STORAGE_OVERHEAD: u64 = 128;
const RENT_EXEMPT_LAMPORTS_PER_BYTE: u64 = 6_960;

/// Anchor discriminator: sha256("<namespace>:<name>")[0..8]
fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    let hash = hasher.finalize();
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..DISCRIMINATOR_LEN]);
    out
}

/// Minimum balance keeping an account of `data_len` bytes rent exempt
pub fn rent_exempt_minimum(data_len: usize) -> u64 {
    (ACCOUNT_STORAGE_OVERHEAD + data_len as u64) * RENT_EXEMPT_LAMPORTS_PER_BYTE
}

/// Account layouts owned by the inheritance program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountLayout {
    Native,
    Token,
    SmartWallet,
}

impl AccountLayout {
    pub fn all() -> [AccountLayout; 3] {
        [
            AccountLayout::Native,
            AccountLayout::Token,
            AccountLayout::SmartWallet,
        ]
    }

    fn account_name(self) -> &'static str {
        match self {
            AccountLayout::Native => "InheritanceAccount",
            AccountLayout::Token => "TokenInheritanceAccount",
            AccountLayout::SmartWallet => "SmartWallet",
        }
    }

    pub fn discriminator(self) -> [u8; 8] {
        discriminator("account", self.account_name())
    }

    fn from_discriminator(bytes: &[u8]) -> Option<Self> {
        Self::all()
            .into_iter()
            .find(|layout| layout.discriminator() == bytes)
    }
}

#[derive(BorshSerialize, BorshDeserialize)]
struct NativeInheritanceLayout {
    owner: [u8; 32],
    heir: [u8; 32],
    inactivity_period: i64,
    last_active: i64,
    is_executed: bool,
    amount: u64,
    bump: u8,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct TokenInheritanceLayout {
    owner: [u8; 32],
    heir: [u8; 32],
    mint: [u8; 32],
    inactivity_period: i64,
    last_active: i64,
    is_executed: bool,
    amount: u64,
    bump: u8,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct HeirShareLayout {
    heir: [u8; 32],
    percentage: u8,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct SmartWalletLayout {
    owner: [u8; 32],
    heirs: Vec<HeirShareLayout>,
    inactivity_period: i64,
    last_active: i64,
    is_executed: bool,
    bump: u8,
}

/// Client-side binding of the on-ledger inheritance program
#[derive(Debug, Clone)]
pub struct InheritanceProgram {
    program_id: Pubkey,
}

impl InheritanceProgram {
    pub fn new(program_id: Pubkey) -> Self {
        Self { program_id }
    }

    pub fn program_id(&self) -> &Pubkey {
        &self.program_id
    }

    /// Ledger address holding the record identified by `id`
    pub fn record_address(&self, id: &RecordId) -> Pubkey {
        match id {
            RecordId::Native { owner, heir } => {
                Pubkey::find_program_address(
                    &[INHERITANCE_SEED, owner.as_ref(), heir.as_ref()],
                    &self.program_id,
                )
                .0
            }
            RecordId::Token { owner, heir, mint } => {
                Pubkey::find_program_address(
                    &[
                        TOKEN_INHERITANCE_SEED,
                        owner.as_ref(),
                        heir.as_ref(),
                        mint.as_ref(),
                    ],
                    &self.program_id,
                )
                .0
            }
            RecordId::MultiHeir { address } => *address,
        }
    }

    pub fn smart_wallet_address(&self, owner: &Pubkey) -> Pubkey {
        Pubkey::find_program_address(&[SMART_WALLET_SEED, owner.as_ref()], &self.program_id).0
    }

    /// One filter set per account layout; each is a separate enumeration
    pub fn discovery_filters(&self) -> Vec<(AccountLayout, AccountFilter)> {
        AccountLayout::all()
            .into_iter()
            .map(|layout| {
                (
                    layout,
                    AccountFilter {
                        offset: 0,
                        bytes: layout.discriminator().to_vec(),
                    },
                )
            })
            .collect()
    }

    /// Decode a raw account into a record.
    ///
    /// Layout defects surface as `LedgerError::Decode`; the record is not
    /// validated here.
    pub fn decode(&self, address: Pubkey, account: &AccountSnapshot) -> AppResult<InheritanceRecord> {
        let decode_err = |reason: String| LedgerError::Decode { address, reason };

        if account.data.len() < DISCRIMINATOR_LEN {
            return Err(decode_err(format!("account too short ({} bytes)", account.data.len())).into());
        }

        let layout = AccountLayout::from_discriminator(&account.data[..DISCRIMINATOR_LEN]).ok_or_else(
            || {
                ValidationError::UnknownLayout(hex::encode(&account.data[..DISCRIMINATOR_LEN]))
            },
        )?;

        let mut body = &account.data[DISCRIMINATOR_LEN..];

        let record = match layout {
            AccountLayout::Native => {
                let raw = NativeInheritanceLayout::deserialize(&mut body)
                    .map_err(|e| decode_err(e.to_string()))?;
                InheritanceRecord {
                    address,
                    owner: Pubkey::new_from_array(raw.owner),
                    kind: RecordKind::Native {
                        heir: Pubkey::new_from_array(raw.heir),
                    },
                    inactivity_period_secs: raw.inactivity_period,
                    last_active_at: raw.last_active,
                    is_executed: raw.is_executed,
                    balance: raw.amount,
                }
            }
            AccountLayout::Token => {
                let raw = TokenInheritanceLayout::deserialize(&mut body)
                    .map_err(|e| decode_err(e.to_string()))?;
                InheritanceRecord {
                    address,
                    owner: Pubkey::new_from_array(raw.owner),
                    kind: RecordKind::Token {
                        heir: Pubkey::new_from_array(raw.heir),
                        mint: Pubkey::new_from_array(raw.mint),
                    },
                    inactivity_period_secs: raw.inactivity_period,
                    last_active_at: raw.last_active,
                    is_executed: raw.is_executed,
                    balance: raw.amount,
                }
            }
            AccountLayout::SmartWallet => {
                let raw = SmartWalletLayout::deserialize(&mut body)
                    .map_err(|e| decode_err(e.to_string()))?;
                InheritanceRecord {
                    address,
                    owner: Pubkey::new_from_array(raw.owner),
                    kind: RecordKind::MultiHeir {
                        allocations: raw
                            .heirs
                            .into_iter()
                            .map(|share| HeirAllocation {
                                heir: Pubkey::new_from_array(share.heir),
                                percentage: share.percentage,
                            })
                            .collect(),
                    },
                    inactivity_period_secs: raw.inactivity_period,
                    last_active_at: raw.last_active,
                    is_executed: raw.is_executed,
                    // The wallet holds the inherited lamports itself, above its rent reserve
                    balance: account
                        .lamports
                        .saturating_sub(rent_exempt_minimum(account.data.len())),
                }
            }
        };

        Ok(record)
    }

    /// Keeper-signed execution of the whole record
    pub fn execute_instruction(&self, record: &InheritanceRecord, keeper: &Pubkey) -> Instruction {
        self.transfer_instruction(record, keeper, None)
    }

    /// Heir-signed claim. For a multi-heir wallet it pays out every share
    /// but is signed and paid for by `heir`.
    pub fn claim_instruction(&self, record: &InheritanceRecord, heir: &Pubkey) -> Instruction {
        self.transfer_instruction(record, heir, Some(heir))
    }

    fn transfer_instruction(
        &self,
        record: &InheritanceRecord,
        signer: &Pubkey,
        claimant: Option<&Pubkey>,
    ) -> Instruction {
        let system_program = Pubkey::new_from_array([0u8; 32]);
        let claim = claimant.is_some();

        match &record.kind {
            RecordKind::Native { heir } => {
                let name = if claim { "claim_inheritance" } else { "execute_inheritance" };
                let mut accounts = vec![
                    AccountMeta::new(record.address, false),
                    AccountMeta::new_readonly(record.owner, false),
                    AccountMeta::new(*heir, claim),
                ];
                if !claim {
                    accounts.push(AccountMeta::new(*signer, true));
                }
                accounts.push(AccountMeta::new_readonly(system_program, false));
                Instruction {
                    program_id: self.program_id,
                    accounts,
                    data: discriminator("global", name).to_vec(),
                }
            }
            RecordKind::Token { heir, mint } => {
                let name = if claim {
                    "claim_token_inheritance"
                } else {
                    "execute_token_inheritance"
                };
                let vault = spl_associated_token_account::get_associated_token_address(
                    &record.address,
                    mint,
                );
                let heir_token_account =
                    spl_associated_token_account::get_associated_token_address(heir, mint);
                let mut accounts = vec![
                    AccountMeta::new(record.address, false),
                    AccountMeta::new_readonly(record.owner, false),
                    AccountMeta::new(vault, false),
                    AccountMeta::new(heir_token_account, false),
                    AccountMeta::new(*heir, claim),
                    AccountMeta::new_readonly(*mint, false),
                ];
                if !claim {
                    accounts.push(AccountMeta::new(*signer, true));
                }
                accounts.extend([
                    AccountMeta::new_readonly(spl_token::ID, false),
                    AccountMeta::new_readonly(spl_associated_token_account::ID, false),
                    AccountMeta::new_readonly(system_program, false),
                ]);
                Instruction {
                    program_id: self.program_id,
                    accounts,
                    data: discriminator("global", name).to_vec(),
                }
            }
            RecordKind::MultiHeir { allocations } => {
                let name = if claim {
                    "claim_smart_wallet_inheritance"
                } else {
                    "execute_smart_wallet_inheritance"
                };
                let mut accounts = vec![
                    AccountMeta::new(record.address, false),
                    AccountMeta::new(*signer, true),
                    AccountMeta::new_readonly(system_program, false),
                ];
                // Heirs travel as remaining accounts, in allocation order
                accounts.extend(allocations.iter().map(|a| AccountMeta::new(a.heir, false)));
                Instruction {
                    program_id: self.program_id,
                    accounts,
                    data: discriminator("global", name).to_vec(),
                }
            }
        }
    }

    /// Serialize a record into the account bytes the program would hold.
    #[cfg(test)]
    pub fn encode(&self, record: &InheritanceRecord) -> AccountSnapshot {
        let (layout, body) = match &record.kind {
            RecordKind::Native { heir } => (
                AccountLayout::Native,
                borsh::to_vec(&NativeInheritanceLayout {
                    owner: record.owner.to_bytes(),
                    heir: heir.to_bytes(),
                    inactivity_period: record.inactivity_period_secs,
                    last_active: record.last_active_at,
                    is_executed: record.is_executed,
                    amount: record.balance,
                    bump: 255,
                }),
            ),
            RecordKind::Token { heir, mint } => (
                AccountLayout::Token,
                borsh::to_vec(&TokenInheritanceLayout {
                    owner: record.owner.to_bytes(),
                    heir: heir.to_bytes(),
                    mint: mint.to_bytes(),
                    inactivity_period: record.inactivity_period_secs,
                    last_active: record.last_active_at,
                    is_executed: record.is_executed,
                    amount: record.balance,
                    bump: 255,
                }),
            ),
            RecordKind::MultiHeir { allocations } => (
                AccountLayout::SmartWallet,
                borsh::to_vec(&SmartWalletLayout {
                    owner: record.owner.to_bytes(),
                    heirs: allocations
                        .iter()
                        .map(|a| HeirShareLayout {
                            heir: a.heir.to_bytes(),
                            percentage: a.percentage,
                        })
                        .collect(),
                    inactivity_period: record.inactivity_period_secs,
                    last_active: record.last_active_at,
                    is_executed: record.is_executed,
                    bump: 255,
                }),
            ),
        };

        let mut data = layout.discriminator().to_vec();
        data.extend(body.expect("borsh encoding of fixed layouts"));

        let lamports = match layout {
            AccountLayout::SmartWallet => rent_exempt_minimum(data.len()) + record.balance,
            _ => rent_exempt_minimum(data.len()),
        };

        AccountSnapshot { data, lamports }
    }
}
