// ============================================================================
// src/cmd/mod.rs – command subsystem root
// ============================================================================
pub mod base; // allowlisted external programs (Cmd, OutputData)
pub mod deploy; // znx deploy
pub mod init; // znx init // znx restore-esp
pub mod maintain; // znx revert / clean / reset / remove / stats / list
pub mod update; // znx update
