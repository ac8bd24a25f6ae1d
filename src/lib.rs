/*!
# GymDesk

A gym management web application for instructors and their students, built in Rust.

## Overview

Instructors manage their roster, upload PDF training routines, follow attendance
and send push notifications to their students' devices. Students check in once a
day, download the routine assigned to them and browse an exercise catalog backed
by the public wger database. The pages are server-rendered and installable as a
progressive web app.

## Architecture

### Frontend Layer
- **Technologies**: Handlebars templates, plain JavaScript, a service worker
- **Key Components**:
  - Instructor dashboard - Overview, students, routines, attendance, notifications
  - Student dashboard - Check-in, routine download, exercise browser
  - Service worker - Offline shell cache and push notification display

### Backend Layer
- **Technologies**: Rust, axum, tokio
- **Core Components**:
  - Session store - Cookie sessions resolved to the user record
  - Role guards - Instructor-only and student-only route groups
  - Exercise proxy - Pass-through to wger with pagination links rewritten
  - Push dispatcher - VAPID-signed web push, dead subscriptions pruned

### Data Layer
- Hosted PostgREST database and object storage, or
- A local JSON-file store with HMAC-SHA256 signed download links

## Modules

- **app**: State, routing and the server loop
- **attendance**: Daily check-in, listings, filters and exports
- **config**: Environment configuration
- **dashboard**: The two role dashboards
- **downloader**: CSV and XLSX rendering of attendance
- **error**: Handler error type
- **exercises**: Exercise proxy and catalog
- **login**: Authentication, sessions and role middleware
- **models**: Persisted records
- **notifications**: Notification composer and templates
- **overview**: Instructor statistics
- **push**: Subscriptions and web-push delivery
- **routines**: Routine upload, download and deletion
- **store**: Storage backends
- **students**: Roster management
- **views**: Templates, flash messages and PWA assets

## REST API Endpoints

- `/api/exercises` - Public proxy to the exercise database
- `/api/exercises/catalog` - Normalized exercise page
- `/api/send-push` - Push a notification to users
- `/api/push/subscribe` - Register a device subscription
- `/api/push/key` - VAPID public key
- `/api/me` - The signed-in user
*/

pub mod app;
pub mod attendance;
pub mod config;
pub mod dashboard;
pub mod downloader;
pub mod error;
pub mod exercises;
pub mod login;
pub mod models;
pub mod notifications;
pub mod overview;
pub mod push;
pub mod routines;
pub mod store;
pub mod students;
pub mod views;
