//! Demo records used to seed the local store on first access.

use serde_json::{Value, json};

use crate::store::EntityKind;

pub const PROFILES_KEY: &str = "profiles";
pub const LICENSE_KEY: &str = "license";

pub fn seed(kind: EntityKind) -> Vec<Value> {
    let value = match kind {
        EntityKind::Instances => instances(),
        EntityKind::Contacts => json!([
            {"id": "ct-1", "name": "Lucia Prado", "phone": "+5511988880001", "tags": ["vip"]},
            {"id": "ct-2", "name": "Rafael Souza", "phone": "+5511988880002", "tags": []},
            {"id": "ct-3", "name": "Helena Costa", "phone": "+5511988880003", "email": "helena@example.com", "tags": ["lead"]}
        ]),
        EntityKind::Campaigns => json!([
            {"id": "cp-1", "name": "Black Friday", "status": "scheduled", "instanceId": "inst-demo-1", "scheduledAt": "2024-11-29T12:00:00Z", "sent": 0, "total": 1200},
            {"id": "cp-2", "name": "Welcome series", "status": "running", "instanceId": "inst-demo-2", "sent": 340, "total": 500}
        ]),
        EntityKind::Transactions => json!([
            {"id": "tx-1", "amountCents": 19900, "currency": "BRL", "description": "Pro plan - monthly", "status": "paid", "createdAt": "2024-10-01T09:00:00Z"},
            {"id": "tx-2", "amountCents": 4900, "currency": "BRL", "description": "Extra seat", "status": "paid", "createdAt": "2024-10-12T15:30:00Z"}
        ]),
        EntityKind::Webhooks => json!([
            {"id": "wh-1", "event": "message.received", "url": "https://hooks.example.com/inbound", "enabled": true},
            {"id": "wh-2", "event": "instance.connected", "url": "https://hooks.example.com/status", "enabled": false}
        ]),
        EntityKind::Conversations => json!([
            {"id": "cv-1", "contactId": "ct-1", "instanceId": "inst-demo-1", "lastMessage": "Obrigada!", "unread": 2, "updatedAt": "2024-10-20T10:15:00Z"},
            {"id": "cv-2", "contactId": "ct-3", "instanceId": "inst-demo-2", "lastMessage": "Qual o prazo?", "unread": 0, "updatedAt": "2024-10-20T11:40:00Z"}
        ]),
        EntityKind::Messages => json!([
            {"id": "msg-1", "conversationId": "cv-1", "direction": "in", "body": "Oi, meu pedido chegou?", "sentAt": "2024-10-20T10:10:00Z"},
            {"id": "msg-2", "conversationId": "cv-1", "direction": "out", "body": "Chegou sim, ja esta a caminho.", "sentAt": "2024-10-20T10:12:00Z"},
            {"id": "msg-3", "conversationId": "cv-1", "direction": "in", "body": "Obrigada!", "sentAt": "2024-10-20T10:15:00Z"}
        ]),
        EntityKind::Tags => json!([
            {"id": "tag-1", "name": "vip", "color": "#f5a623"},
            {"id": "tag-2", "name": "lead", "color": "#4a90e2"}
        ]),
    };
    match value {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

fn instances() -> Value {
    json!([
        {
            "id": "inst-demo-1",
            "name": "vendas",
            "status": "connected",
            "phone": "+5511999990001",
            "lastUpdate": "2024-10-20T10:15:00Z",
            "messagesUsed": 420,
            "messagesLimit": 1000,
            "ownerId": "u-ana",
            "ownerName": "Ana Lima",
            "createdAt": "2024-09-01T08:00:00Z"
        },
        {
            "id": "inst-demo-2",
            "name": "suporte",
            "status": "disconnected",
            "lastUpdate": "2024-10-18T17:02:00Z",
            "messagesUsed": 80,
            "messagesLimit": 1000,
            "ownerId": "u-marco",
            "ownerName": "Marco Reis",
            "createdAt": "2024-09-10T08:00:00Z"
        }
    ])
}

/// Team members counted as occupied seats in mock mode.
pub fn profiles() -> Value {
    json!([
        {"id": "u-ana", "name": "Ana Lima", "role": "agent"},
        {"id": "u-marco", "name": "Marco Reis", "role": "manager"}
    ])
}

pub fn license() -> Value {
    json!({
        "tier": "pro",
        "status": "active",
        "renewalDate": "2025-01-01T00:00:00Z",
        "limits": {
            "maxSeats": 3,
            "maxMessagesPerMonth": 10000,
            "maxContacts": 5000
        },
        "addonSeats": 0,
        "features": ["campaigns", "webhooks", "api"]
    })
}
