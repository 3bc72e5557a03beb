// Projection schema, defined once with the latest known shape. 256-bit
// quantities are stored as decimal text and compared via ::numeric casts;
// addresses and hashes as 0x-prefixed lowercase hex.

table! {
    orders (hash) {
        hash -> Varchar,
        kind -> Varchar,
        side -> Varchar,
        maker -> Varchar,
        price -> Varchar,
        value -> Varchar,
        quantity_remaining -> Varchar,
        token_set_id -> Varchar,
        nonce -> Nullable<Varchar>,
        fee_bps -> BigInt,
        source_id -> Nullable<Varchar>,
        royalty_info -> Nullable<Text>,
        raw_data -> Text,
        payment_token -> Varchar,
        conduit -> Nullable<Varchar>,
        listing_time -> BigInt,
        expiration_time -> BigInt,
        fillability_status -> Varchar,
        approval_status -> Varchar,
        expiration -> BigInt,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    token_sets (id) {
        id -> Varchar,
        label -> Text,
        label_hash -> Varchar,
        merkle_root -> Nullable<Varchar>,
    }
}

table! {
    token_sets_tokens (token_set_id, contract, token_id) {
        token_set_id -> Varchar,
        contract -> Varchar,
        token_id -> Varchar,
    }
}

table! {
    tokens (contract, token_id) {
        contract -> Varchar,
        token_id -> Varchar,
    }
}

table! {
    contracts (address) {
        address -> Varchar,
        kind -> Varchar,
    }
}

table! {
    collections (contract) {
        contract -> Varchar,
        royalty_recipient -> Nullable<Varchar>,
    }
}

table! {
    attributes (collection, key, value, contract, token_id) {
        collection -> Varchar,
        key -> Varchar,
        value -> Varchar,
        contract -> Varchar,
        token_id -> Varchar,
    }
}

table! {
    proxies (owner) {
        owner -> Varchar,
        proxy -> Varchar,
    }
}

table! {
    nft_transfer_events (block_hash, tx_hash, log_index, batch_index) {
        block_hash -> Varchar,
        tx_hash -> Varchar,
        log_index -> BigInt,
        batch_index -> BigInt,
        block -> BigInt,
        contract -> Varchar,
        token_id -> Varchar,
        sender -> Varchar,
        recipient -> Varchar,
        amount -> Varchar,
    }
}

table! {
    nft_approval_events (block_hash, tx_hash, log_index) {
        block_hash -> Varchar,
        tx_hash -> Varchar,
        log_index -> BigInt,
        block -> BigInt,
        contract -> Varchar,
        owner -> Varchar,
        operator -> Varchar,
        approved -> Bool,
    }
}

table! {
    ft_transfer_events (block_hash, tx_hash, log_index) {
        block_hash -> Varchar,
        tx_hash -> Varchar,
        log_index -> BigInt,
        block -> BigInt,
        contract -> Varchar,
        sender -> Varchar,
        recipient -> Varchar,
        amount -> Varchar,
    }
}

table! {
    ft_approval_events (block_hash, tx_hash, log_index) {
        block_hash -> Varchar,
        tx_hash -> Varchar,
        log_index -> BigInt,
        block -> BigInt,
        contract -> Varchar,
        owner -> Varchar,
        spender -> Varchar,
        amount -> Varchar,
    }
}

table! {
    cancel_events (block_hash, tx_hash, log_index) {
        block_hash -> Varchar,
        tx_hash -> Varchar,
        log_index -> BigInt,
        block -> BigInt,
        order_hash -> Varchar,
    }
}

table! {
    fill_events (block_hash, tx_hash, log_index) {
        block_hash -> Varchar,
        tx_hash -> Varchar,
        log_index -> BigInt,
        block -> BigInt,
        buy_order_hash -> Varchar,
        sell_order_hash -> Varchar,
        maker -> Varchar,
        taker -> Varchar,
        price -> Varchar,
    }
}

table! {
    bulk_cancel_events (block_hash, tx_hash, log_index) {
        block_hash -> Varchar,
        tx_hash -> Varchar,
        log_index -> BigInt,
        block -> BigInt,
        maker -> Varchar,
        min_nonce -> Varchar,
    }
}

table! {
    nft_balances (contract, token_id, owner) {
        contract -> Varchar,
        token_id -> Varchar,
        owner -> Varchar,
        amount -> Varchar,
    }
}

table! {
    ft_balances (contract, owner) {
        contract -> Varchar,
        owner -> Varchar,
        amount -> Varchar,
    }
}

table! {
    ft_approvals (contract, owner, spender) {
        contract -> Varchar,
        owner -> Varchar,
        spender -> Varchar,
        amount -> Varchar,
    }
}
