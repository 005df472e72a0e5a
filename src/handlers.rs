//! Handlers shipped with the binary.
//!
//! Mail delivery itself lives outside this crate; these handlers validate
//! their inputs and record the outgoing message in the job log.

use serde::Serialize;
use tracing::info;

use crate::error::InvocationError;
use crate::invoker::{HandlerBuilder, HandlerRegistry};

/// Registry with every built-in handler.
pub fn builtin_registry() -> HandlerRegistry {
    HandlerRegistry::new()
        .with(greeter())
        .with(send_welcome_email())
        .with(send_password_reset_email())
}

#[derive(Debug)]
pub struct Greeter;

impl Greeter {
    pub fn say_hello(&self, name: &str) -> String {
        let greeting = format!("Hello, {name}!");
        info!(target: "background_jobs", %greeting, "greeter ran");
        greeting
    }
}

fn greeter() -> crate::invoker::HandlerDescriptor {
    HandlerBuilder::new("Greeter", &[], |_| Ok(Greeter))
        .method("sayHello", &["name"], |greeter: &mut Greeter, args| {
            Ok(greeter.say_hello(&args.text("name")?))
        })
        .build()
}

/// Description of a message handed to the mailer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMail {
    pub template: &'static str,
    pub recipient: String,
}

#[derive(Debug)]
pub struct SendWelcomeEmail {
    user_id: i64,
}

impl SendWelcomeEmail {
    pub fn handle(&self) -> Result<OutgoingMail, InvocationError> {
        if self.user_id <= 0 {
            return Err(InvocationError::Failed(format!(
                "invalid user id {}",
                self.user_id
            )));
        }
        let mail = OutgoingMail {
            template: "welcome",
            recipient: format!("user:{}", self.user_id),
        };
        info!(target: "background_jobs", recipient = %mail.recipient, "welcome email queued");
        Ok(mail)
    }
}

fn send_welcome_email() -> crate::invoker::HandlerDescriptor {
    HandlerBuilder::new("SendWelcomeEmail", &["user_id"], |args| {
        Ok(SendWelcomeEmail {
            user_id: args.int("user_id")?,
        })
    })
    .method("handle", &[], |job: &mut SendWelcomeEmail, _| job.handle())
    .build()
}

#[derive(Debug, Default)]
pub struct SendPasswordResetEmail;

impl SendPasswordResetEmail {
    pub fn handle(&self, email: &str) -> Result<OutgoingMail, InvocationError> {
        self.send_reset_link(email, None)
    }

    pub fn send_reset_link(
        &self,
        email: &str,
        token: Option<&str>,
    ) -> Result<OutgoingMail, InvocationError> {
        if !email.contains('@') {
            return Err(InvocationError::Failed(format!(
                "`{email}` is not an email address"
            )));
        }
        let mail = OutgoingMail {
            template: if token.is_some() {
                "password_reset_link"
            } else {
                "password_reset"
            },
            recipient: email.to_string(),
        };
        info!(
            target: "background_jobs",
            recipient = %mail.recipient,
            template = mail.template,
            "password reset email queued"
        );
        Ok(mail)
    }
}

fn send_password_reset_email() -> crate::invoker::HandlerDescriptor {
    HandlerBuilder::new("SendPasswordResetEmail", &[], |_| {
        Ok(SendPasswordResetEmail)
    })
    .method("handle", &["email"], |job: &mut SendPasswordResetEmail, args| {
        job.handle(&args.text("email")?)
    })
    .method(
        "sendResetLink",
        &["email", "token"],
        |job: &mut SendPasswordResetEmail, args| {
            job.send_reset_link(&args.text("email")?, args.opt_text("token").as_deref())
        },
    )
    .build()
}
